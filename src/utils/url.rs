//! Endpoint URL construction
//!
//! Service base URLs are user-supplied and frequently carry trailing slashes;
//! these helpers keep joined endpoint paths free of doubled separators.

/// Strip trailing slashes from a service base URL.
///
/// ```
/// use murmur::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:11434/v1/"), "http://localhost:11434/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Join a service base URL and an endpoint path with exactly one slash.
///
/// ```
/// use murmur::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.openai.com/v1/", "/chat/completions"),
///     "https://api.openai.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}
