use std::cmp::Ordering;

use tracing::debug;

use crate::api::{ModelInfo, ModelsResponse};
use crate::core::chat_stream::{format_api_error, ConnectionError};
use crate::core::session::ServiceEndpoint;
use crate::utils::auth::add_auth_headers;
use crate::utils::url::construct_api_url;

/// List the models a service offers via `GET {base_url}/models`.
pub async fn fetch_models(
    client: &reqwest::Client,
    endpoint: &ServiceEndpoint,
) -> Result<ModelsResponse, ConnectionError> {
    let models_url = construct_api_url(&endpoint.base_url, "models");
    debug!(url = %models_url, "Fetching model list");

    let request = client
        .get(models_url)
        .header("Content-Type", "application/json");
    let request = add_auth_headers(
        request,
        endpoint.auth_mode,
        endpoint.api_key.as_deref().unwrap_or_default(),
    );

    let response = request
        .send()
        .await
        .map_err(|err| ConnectionError::unreachable(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(ConnectionError::status(
            status.as_u16(),
            format_api_error(&error_text),
        ));
    }

    response
        .json::<ModelsResponse>()
        .await
        .map_err(|err| ConnectionError::unreachable(format!("invalid model list: {err}")))
}

/// Newest first. OpenAI-style `created` timestamps win over Anthropic-style
/// `created_at` strings; undated models sort last by id.
pub fn sort_models(models: &mut [ModelInfo]) {
    models.sort_by(|a, b| match (a.created, b.created) {
        (Some(a_created), Some(b_created)) => b_created.cmp(&a_created),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => match (&a.created_at, &b.created_at) {
            (Some(a_at), Some(b_at)) => b_at.cmp(a_at),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        },
    });
}
