//! Authentication headers for service requests
//!
//! Services speak one of two header schemes: the common
//! `Authorization: Bearer` form, or Anthropic's `x-api-key` with a pinned
//! `anthropic-version`.

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// How a service expects its API key to be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    Bearer,
    Anthropic,
}

impl AuthMode {
    /// Map a configured `mode` string to an auth scheme. Unknown or missing
    /// modes fall back to bearer tokens.
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode {
            Some(mode) if mode.eq_ignore_ascii_case("anthropic") => AuthMode::Anthropic,
            _ => AuthMode::Bearer,
        }
    }
}

/// Attach the headers required by `mode` to `request`.
///
/// An empty key adds nothing, which is what keyless local services expect.
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    mode: AuthMode,
    api_key: &str,
) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        return request;
    }

    match mode {
        AuthMode::Anthropic => request
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION),
        AuthMode::Bearer => request.header("Authorization", format!("Bearer {api_key}")),
    }
}
