//! Cancellation endpoint for in-flight generation tasks.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use parlor_core::TaskKind;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub client_id: String,
}

/// Removes the task entry, then performs kind-specific teardown with no
/// lock held.
pub async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.client_id.is_empty() {
        return Err(ApiError::bad_request("client_id is required"));
    }

    let Some(snapshot) = state.tasks.cancel(&req.client_id) else {
        return Err(ApiError::not_found(format!(
            "No active task found for client {}",
            req.client_id
        )));
    };

    snapshot.cancel.cancel();
    match snapshot.kind {
        TaskKind::Text { backend } => {
            info!(client_id = req.client_id, backend = %backend, "text task cancelled");
        }
        TaskKind::Image => {
            info!(
                client_id = req.client_id,
                prompt_id = ?snapshot.prompt_id,
                "image task cancelled, interrupting engine"
            );
            let base_url = state.config.read().await.comfyui_api.clone();
            state.image.interrupt(&base_url, &req.client_id).await;
        }
    }

    Ok(Json(json!({
        "status": "success",
        "message": "Cancellation requested",
    })))
}
