use crate::core::config::data::Config;

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        match &self.default_service {
            Some(service) => println!("  default-service: {service}"),
            None => println!("  default-service: (unset)"),
        }
        match &self.system_prompt {
            Some(prompt) => println!("  system-prompt: {prompt}"),
            None => println!("  system-prompt: (unset)"),
        }
        if self.default_models.is_empty() {
            println!("  default-models: (none set)");
        } else {
            println!("  default-models:");
            let mut models: Vec<_> = self.default_models.iter().collect();
            models.sort();
            for (service, model) in models {
                println!("    {service}: {model}");
            }
        }
        if !self.services.is_empty() {
            println!("  services:");
            for service in &self.services {
                println!(
                    "    {} ({}): {}",
                    service.id, service.display_name, service.base_url
                );
            }
        }
    }
}
