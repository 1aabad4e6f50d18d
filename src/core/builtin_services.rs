//! Built-in service configuration
//!
//! The services listed in `builtin_services.toml` are embedded at compile
//! time so a fresh install can talk to the common endpoints.

use serde::Deserialize;
use tracing::warn;

use crate::utils::auth::AuthMode;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BuiltinService {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub mode: Option<String>,
    #[serde(default = "default_requires_key")]
    pub requires_key: bool,
}

fn default_requires_key() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BuiltinServicesConfig {
    services: Vec<BuiltinService>,
}

impl BuiltinService {
    pub fn auth_mode(&self) -> AuthMode {
        AuthMode::from_mode(self.mode.as_deref())
    }
}

const CONFIG_CONTENT: &str = include_str!("../builtin_services.toml");

fn parse_builtin_services(content: &str) -> Vec<BuiltinService> {
    match toml::from_str::<BuiltinServicesConfig>(content) {
        Ok(config) => config.services,
        Err(err) => {
            warn!(error = %err, "Ignoring malformed built-in service table");
            Vec::new()
        }
    }
}

pub fn load_builtin_services() -> Vec<BuiltinService> {
    parse_builtin_services(CONFIG_CONTENT)
}

/// Find a built-in service by id (case-insensitive)
pub fn find_builtin_service(id: &str) -> Option<BuiltinService> {
    load_builtin_services()
        .into_iter()
        .find(|service| service.id.eq_ignore_ascii_case(id))
}
