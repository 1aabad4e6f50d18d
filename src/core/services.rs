//! Turn a requested service id into a [`ServiceEndpoint`] with its API key.
//!
//! Custom services from the config shadow built-ins with the same id. Keys
//! come from `<ID>_API_KEY`, then the keyring; with no service requested at
//! all, `OPENAI_API_KEY` / `OPENAI_BASE_URL` are used directly.

use std::error::Error;
use std::fmt;

use tracing::{debug, warn};

use crate::core::builtin_services::find_builtin_service;
use crate::core::config::Config;
use crate::core::keyring::{get_api_key, KeyringAccessError};
use crate::core::session::ServiceEndpoint;
use crate::utils::auth::AuthMode;
use crate::utils::url::normalize_base_url;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const QUICK_FIXES: &[&str] = &[
    "murmur set api-key <service> <key>   # Store a key in the system keyring",
    "murmur set default-service <id>      # Pick the service used by default",
    "export OPENAI_API_KEY=sk-...         # Use environment variable (defaults to OpenAI API)",
];

#[derive(Debug)]
pub struct ServiceResolutionError {
    message: String,
    quick_fixes: &'static [&'static str],
    exit_code: i32,
}

impl ServiceResolutionError {
    pub fn missing_authentication() -> Self {
        Self::new(
            "❌ No service selected and OPENAI_API_KEY environment variable not set",
            QUICK_FIXES,
            2,
        )
    }

    pub fn unknown_service(service: &str) -> Self {
        Self::new(
            format!(
                "❌ Unknown service '{service}'. \
                 Built-in services: openai, openrouter, anthropic, ollama."
            ),
            &[],
            2,
        )
    }

    pub fn missing_key(service: &str) -> Self {
        Self::new(
            format!(
                "❌ No API key found for service '{service}'. Set {} or store one in the keyring.",
                key_env_var(service)
            ),
            QUICK_FIXES,
            2,
        )
    }

    pub fn keyring(service: &str, err: KeyringAccessError) -> Self {
        Self::new(
            format!("❌ Could not read the API key for '{service}': {err}"),
            &[],
            1,
        )
    }

    fn new(
        message: impl Into<String>,
        quick_fixes: &'static [&'static str],
        exit_code: i32,
    ) -> Self {
        Self {
            message: message.into(),
            quick_fixes,
            exit_code,
        }
    }

    pub fn quick_fixes(&self) -> &'static [&'static str] {
        self.quick_fixes
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl fmt::Display for ServiceResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ServiceResolutionError {}

/// Where API keys come from.
pub trait KeySource {
    fn env_var(&self, name: &str) -> Option<String>;
    fn stored_key(&self, service_id: &str) -> Result<Option<String>, KeyringAccessError>;
}

/// Process environment plus the platform keyring.
pub struct SystemKeySource;

impl KeySource for SystemKeySource {
    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }

    fn stored_key(&self, service_id: &str) -> Result<Option<String>, KeyringAccessError> {
        get_api_key(service_id)
    }
}

/// `openrouter` -> `OPENROUTER_API_KEY`, `my-llm` -> `MY_LLM_API_KEY`.
pub fn key_env_var(service_id: &str) -> String {
    let stem: String = service_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}_API_KEY")
}

struct ServiceDefinition {
    id: String,
    display_name: String,
    base_url: String,
    mode: Option<String>,
    requires_key: bool,
}

fn find_service(config: &Config, id: &str) -> Option<ServiceDefinition> {
    if let Some(custom) = config.get_custom_service(id) {
        return Some(ServiceDefinition {
            id: custom.id.clone(),
            display_name: custom.display_name.clone(),
            base_url: custom.base_url.clone(),
            mode: custom.mode.clone(),
            requires_key: custom.requires_key,
        });
    }

    find_builtin_service(id).map(|builtin| ServiceDefinition {
        id: builtin.id,
        display_name: builtin.display_name,
        base_url: builtin.base_url,
        mode: builtin.mode,
        requires_key: builtin.requires_key,
    })
}

/// Resolve `requested`, falling back to the configured default service and
/// then to the OpenAI environment variables.
pub fn resolve_service<S: KeySource>(
    source: &S,
    config: &Config,
    requested: Option<&str>,
) -> Result<ServiceEndpoint, ServiceResolutionError> {
    let requested = requested
        .filter(|value| !value.is_empty())
        .or(config.default_service.as_deref());

    match requested {
        Some(id) => resolve_named_service(source, config, id),
        None => resolve_env_service(source),
    }
}

fn resolve_named_service<S: KeySource>(
    source: &S,
    config: &Config,
    id: &str,
) -> Result<ServiceEndpoint, ServiceResolutionError> {
    let service = find_service(config, id)
        .ok_or_else(|| ServiceResolutionError::unknown_service(id))?;
    let service_id = service.id.to_lowercase();

    let api_key = match source.env_var(&key_env_var(&service_id)) {
        Some(key) => Some(key),
        None => match source.stored_key(&service_id) {
            Ok(key) => key,
            Err(err) if err.is_recoverable() => {
                warn!(service = %service_id, error = %err, "Keyring unavailable");
                None
            }
            Err(err) => return Err(ServiceResolutionError::keyring(&service_id, err)),
        },
    };

    let api_key = match api_key {
        Some(key) => key,
        None if !service.requires_key => String::new(),
        None => return Err(ServiceResolutionError::missing_key(&service_id)),
    };

    debug!(service = %service_id, "Resolved service");
    Ok(ServiceEndpoint {
        id: service_id,
        display_name: service.display_name,
        base_url: normalize_base_url(&service.base_url),
        api_key: Some(api_key),
        auth_mode: AuthMode::from_mode(service.mode.as_deref()),
    })
}

fn resolve_env_service<S: KeySource>(
    source: &S,
) -> Result<ServiceEndpoint, ServiceResolutionError> {
    let api_key = source
        .env_var("OPENAI_API_KEY")
        .ok_or_else(ServiceResolutionError::missing_authentication)?;
    let base_url = source
        .env_var("OPENAI_BASE_URL")
        .map(|url| normalize_base_url(&url))
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());

    let (id, display_name) = if base_url == DEFAULT_OPENAI_BASE_URL {
        ("openai", "OpenAI")
    } else {
        ("openai-compatible", "OpenAI-compatible")
    };

    Ok(ServiceEndpoint {
        id: id.to_string(),
        display_name: display_name.to_string(),
        base_url,
        api_key: Some(api_key),
        auth_mode: AuthMode::Bearer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CustomService;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockSource {
        env: HashMap<&'static str, &'static str>,
        stored: HashMap<&'static str, &'static str>,
        keyring_failure: Option<KeyringFailure>,
    }

    #[derive(Clone, Copy)]
    enum KeyringFailure {
        Locked,
        Corrupt,
    }

    impl KeySource for MockSource {
        fn env_var(&self, name: &str) -> Option<String> {
            self.env.get(name).map(|value| value.to_string())
        }

        fn stored_key(&self, service_id: &str) -> Result<Option<String>, KeyringAccessError> {
            match self.keyring_failure {
                Some(KeyringFailure::Locked) => {
                    let backend_error = std::io::Error::other("locked");
                    return Err(keyring::Error::NoStorageAccess(Box::new(backend_error)).into());
                }
                Some(KeyringFailure::Corrupt) => {
                    return Err(keyring::Error::BadEncoding(Vec::new()).into());
                }
                None => {}
            }
            Ok(self.stored.get(service_id).map(|value| value.to_string()))
        }
    }

    fn with_env(pairs: &[(&'static str, &'static str)]) -> MockSource {
        MockSource {
            env: pairs.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn env_key_takes_precedence_over_keyring() {
        let mut source = with_env(&[("OPENROUTER_API_KEY", "sk-env")]);
        source.stored.insert("openrouter", "sk-stored");

        let endpoint = resolve_service(&source, &Config::default(), Some("OpenRouter"))
            .expect("service should resolve");

        assert_eq!(endpoint.id, "openrouter");
        assert_eq!(endpoint.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(endpoint.api_key.as_deref(), Some("sk-env"));
        assert_eq!(endpoint.auth_mode, AuthMode::Bearer);
    }

    #[test]
    fn keyring_key_is_used_without_env() {
        let mut source = MockSource::default();
        source.stored.insert("anthropic", "sk-ant");

        let endpoint =
            resolve_service(&source, &Config::default(), Some("anthropic")).unwrap();
        assert_eq!(endpoint.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(endpoint.auth_mode, AuthMode::Anthropic);
    }

    #[test]
    fn keyless_service_gets_empty_key() {
        let endpoint =
            resolve_service(&MockSource::default(), &Config::default(), Some("ollama")).unwrap();
        assert_eq!(endpoint.api_key.as_deref(), Some(""));
    }

    #[test]
    fn missing_key_is_reported() {
        let err = resolve_service(&MockSource::default(), &Config::default(), Some("openai"))
            .unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
        assert_eq!(err.exit_code(), 2);
        assert!(!err.quick_fixes().is_empty());
    }

    #[test]
    fn default_service_and_custom_services_are_honoured() {
        let mut config = Config {
            default_service: Some("local".to_string()),
            ..Default::default()
        };
        config.add_custom_service(CustomService {
            requires_key: false,
            ..CustomService::new(
                "local".to_string(),
                "Local".to_string(),
                "http://localhost:8080/v1/".to_string(),
                None,
            )
        });

        let endpoint = resolve_service(&MockSource::default(), &config, None).unwrap();
        assert_eq!(endpoint.id, "local");
        assert_eq!(endpoint.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn unknown_service_is_an_error() {
        let err = resolve_service(&MockSource::default(), &Config::default(), Some("nope"))
            .unwrap_err();
        assert!(err.to_string().contains("'nope'"));
    }

    #[test]
    fn no_selection_falls_back_to_openai_env() {
        let source = with_env(&[
            ("OPENAI_API_KEY", "sk-env"),
            ("OPENAI_BASE_URL", "https://example.com/v1/"),
        ]);
        let endpoint = resolve_service(&source, &Config::default(), Some("")).unwrap();
        assert_eq!(endpoint.id, "openai-compatible");
        assert_eq!(endpoint.base_url, "https://example.com/v1");

        let err = resolve_service(&MockSource::default(), &Config::default(), None).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn recoverable_keyring_failure_is_treated_as_missing() {
        let source = MockSource {
            keyring_failure: Some(KeyringFailure::Locked),
            ..Default::default()
        };
        let endpoint =
            resolve_service(&source, &Config::default(), Some("ollama")).unwrap();
        assert_eq!(endpoint.api_key.as_deref(), Some(""));
    }

    #[test]
    fn permanent_keyring_failure_is_propagated() {
        let source = MockSource {
            keyring_failure: Some(KeyringFailure::Corrupt),
            ..Default::default()
        };
        let err = resolve_service(&source, &Config::default(), Some("openai")).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn key_env_var_names() {
        assert_eq!(key_env_var("openrouter"), "OPENROUTER_API_KEY");
        assert_eq!(key_env_var("my-llm"), "MY_LLM_API_KEY");
    }
}
