//! Text-to-speech management and sampling.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let config = state.config_snapshot().await;
    let models = state.tts.list_models(&config.tts_api).await;
    Ok(Json(json!({
        "status": "success",
        "models": models,
        "current_model": config.tts_model,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetModelRequest {
    pub model_name: String,
}

pub async fn set_model(
    State(state): State<AppState>,
    Json(req): Json<SetModelRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.model_name.is_empty() {
        return Err(ApiError::bad_request("model_name is required"));
    }
    let base_url = state.config.read().await.tts_api.clone();
    let speakers = state.tts.set_model(&base_url, &req.model_name).await?;

    // Remember the switch so status reports stay accurate.
    state.config.write().await.tts_model = req.model_name.clone();
    info!(model_name = req.model_name, speakers = speakers.len(), "TTS model set");

    Ok(Json(json!({
        "status": "success",
        "speakers": speakers,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SampleRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

fn default_speed() -> f32 {
    1.0
}

/// Returns a WAV rendition of the given text, marked uncacheable so the
/// browser always plays the freshest sample.
pub async fn sample(
    State(state): State<AppState>,
    Json(req): Json<SampleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let base_url = state.config.read().await.tts_api.clone();
    let wav = state
        .tts
        .synthesize(&base_url, &req.text, req.speaker.as_deref(), req.speed)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));

    Ok((headers, wav))
}
