//! Image generation endpoints backed by a ComfyUI engine.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use parlor_core::{apply_settings, default_workflow, ImageOutcome, ImageSettings};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn comfyui_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let base_url = state.config.read().await.comfyui_api.clone();
    state.image.status(&base_url).await?;
    Ok(Json(json!({
        "status": "success",
        "message": "ComfyUI is reachable",
    })))
}

pub async fn comfyui_checkpoints(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let base_url = state.config.read().await.comfyui_api.clone();
    let checkpoints = state.image.checkpoints(&base_url).await?;
    Ok(Json(json!({
        "status": "success",
        "checkpoints": checkpoints,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateImageRequest {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    /// A full workflow graph; the built-in text-to-image graph when absent.
    #[serde(default)]
    pub workflow: Option<Value>,
    #[serde(default)]
    pub settings: ImageSettings,
}

pub async fn generate_image(
    State(state): State<AppState>,
    Json(req): Json<GenerateImageRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("No prompt provided"));
    }
    let client_id = req
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut workflow = req.workflow.unwrap_or_else(default_workflow);
    apply_settings(&mut workflow, &req.prompt, &req.settings);

    let base_url = state.config.read().await.comfyui_api.clone();
    info!(client_id, "image generation requested");

    match state
        .image
        .generate(&state.tasks, &client_id, &base_url, workflow)
        .await
    {
        Ok(ImageOutcome::Completed { image_url }) => Ok(Json(json!({
            "status": "success",
            "image_url": image_url,
        }))),
        Ok(ImageOutcome::Cancelled) => Ok(Json(json!({ "status": "cancelled" }))),
        Err(err) => {
            error!(client_id, error = %err, "image generation failed");
            Err(err.into())
        }
    }
}
