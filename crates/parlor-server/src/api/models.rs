//! Model discovery for local and hosted providers.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use parlor_core::{Error, UpstreamBody};

use crate::error::ApiError;
use crate::state::AppState;

const LISTING_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ollama_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let base_url = state.config.read().await.ollama_api.clone();
    let url = format!("{base_url}/api/tags");
    let body = state
        .upstream
        .request(reqwest::Method::GET, &url, None, &[], LISTING_TIMEOUT)
        .await?;

    let models: Vec<String> = body
        .as_json()
        .and_then(|v| v.get("models"))
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ApiError::bad_gateway("Ollama response format error"))?;

    info!(count = models.len(), "ollama models fetched");
    Ok(Json(json!({
        "status": "success",
        "models": models,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExternalModelsQuery {
    #[serde(default)]
    pub backend: String,
}

pub async fn external_models(
    State(state): State<AppState>,
    Query(query): Query<ExternalModelsQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.backend.is_empty() {
        return Err(ApiError::bad_request("Backend parameter is required"));
    }
    let config = state.config_snapshot().await;

    let mut models = match query.backend.as_str() {
        "groq" => {
            let key = require_key(&config.groq_api_key, "Groq")?;
            openai_style_listing(&state, "https://api.groq.com/openai/v1/models", &key).await?
        }
        "openai" => {
            let key = require_key(&config.openai_api_key, "OpenAI")?;
            openai_style_listing(&state, "https://api.openai.com/v1/models", &key).await?
        }
        "xai" => {
            let key = require_key(&config.xai_api_key, "xAI")?;
            // xAI mirrors the OpenAI listing shape; fall back to empty if
            // it stops doing so.
            match openai_style_listing(&state, "https://api.x.ai/v1/models", &key).await {
                Ok(models) => models,
                Err(err) => {
                    warn!(error = %err.message, "xAI model listing failed");
                    Vec::new()
                }
            }
        }
        "google" => {
            let key = require_key(&config.google_api_key, "Google")?;
            google_listing(&state, &key).await?
        }
        // No public listing endpoint.
        "anthropic" => Vec::new(),
        "ollama" | "kobold" | "custom_external" => Vec::new(),
        other => {
            return Err(ApiError::bad_request(format!(
                "Unsupported backend: {other}"
            )))
        }
    };

    models.sort();
    info!(backend = query.backend, count = models.len(), "external models fetched");
    Ok(Json(json!({
        "status": "success",
        "models": models,
    })))
}

fn require_key(key: &str, provider: &str) -> Result<String, ApiError> {
    if key.is_empty() {
        Err(ApiError::bad_request(format!(
            "{provider} API key not configured"
        )))
    } else {
        Ok(key.to_string())
    }
}

/// `{"data": [{"id": ...}, ...]}`, the shape shared by OpenAI-compatible
/// providers.
async fn openai_style_listing(
    state: &AppState,
    url: &str,
    api_key: &str,
) -> Result<Vec<String>, ApiError> {
    let headers = [("Authorization", format!("Bearer {api_key}"))];
    let body = state
        .upstream
        .request(reqwest::Method::GET, url, None, &headers, LISTING_TIMEOUT)
        .await
        .map_err(connectivity_error)?;

    body.as_json()
        .and_then(|v| v.get("data"))
        .and_then(Value::as_array)
        .map(|data| {
            data.iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ApiError::bad_gateway(format!("Unexpected response format from {url}")))
}

/// Google's listing nests names under `models[]` and advertises the
/// supported methods per model; only chat-capable ones are offered.
async fn google_listing(state: &AppState, api_key: &str) -> Result<Vec<String>, ApiError> {
    let url =
        format!("https://generativelanguage.googleapis.com/v1beta/models?key={api_key}");
    let body = state
        .upstream
        .request(reqwest::Method::GET, &url, None, &[], LISTING_TIMEOUT)
        .await
        .map_err(connectivity_error)?;

    let UpstreamBody::Json(value) = body else {
        return Err(ApiError::bad_gateway(
            "Unexpected response format from Google model listing",
        ));
    };
    let models = value
        .get("models")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ApiError::bad_gateway("Unexpected response format from Google model listing")
        })?;

    Ok(models
        .iter()
        .filter(|m| {
            m.get("supportedGenerationMethods")
                .and_then(Value::as_array)
                .map(|methods| methods.iter().any(|v| v == "generateContent"))
                .unwrap_or(false)
        })
        .filter_map(|m| m.get("name").and_then(Value::as_str))
        .map(|name| name.trim_start_matches("models/").to_string())
        .collect())
}

fn connectivity_error(err: Error) -> ApiError {
    match err {
        Error::Transport(_) => ApiError::bad_gateway(err.to_string()),
        other => other.into(),
    }
}
