use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A user-defined OpenAI-compatible service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CustomService {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    /// Authentication mode; `"anthropic"` or unset for bearer tokens.
    pub mode: Option<String>,
    /// Set to `false` for local services that accept unauthenticated requests.
    #[serde(default = "default_requires_key")]
    pub requires_key: bool,
}

fn default_requires_key() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    pub default_service: Option<String>,
    /// Default model per service id (lower-cased keys)
    #[serde(default)]
    pub default_models: HashMap<String, String>,
    #[serde(default)]
    pub services: Vec<CustomService>,
    /// Inserted as the leading system message whenever a model is selected
    pub system_prompt: Option<String>,
}

/// Get a user-friendly display string for a path, abbreviating the home
/// directory to `~` on Unix-like systems.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    /// Add a custom service, replacing any existing one with the same id.
    pub fn add_custom_service(&mut self, service: CustomService) {
        self.remove_custom_service(&service.id);
        self.services.push(service);
    }

    pub fn remove_custom_service(&mut self, id: &str) -> bool {
        let before = self.services.len();
        self.services.retain(|s| !s.id.eq_ignore_ascii_case(id));
        self.services.len() != before
    }

    pub fn get_custom_service(&self, id: &str) -> Option<&CustomService> {
        self.services.iter().find(|s| s.id.eq_ignore_ascii_case(id))
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or("")
    }
}

impl CustomService {
    pub fn new(id: String, display_name: String, base_url: String, mode: Option<String>) -> Self {
        Self {
            id,
            display_name,
            base_url,
            mode,
            requires_key: true,
        }
    }
}
