use crate::core::config::data::Config;

impl Config {
    pub fn get_default_model(&self, service: &str) -> Option<&String> {
        let normalized = service.to_lowercase();
        self.default_models
            .get(&normalized)
            .or_else(|| self.default_models.get(service))
    }

    pub fn set_default_model(&mut self, service: String, model: String) {
        let normalized = service.to_lowercase();
        self.default_models.insert(normalized.clone(), model);
        if normalized != service {
            self.default_models.remove(&service);
        }
    }

    pub fn unset_default_model(&mut self, service: &str) {
        let normalized = service.to_lowercase();
        self.default_models.remove(&normalized);
        if normalized != service {
            self.default_models.remove(service);
        }
    }

    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = Some(prompt);
    }

    pub fn unset_system_prompt(&mut self) {
        self.system_prompt = None;
    }
}
