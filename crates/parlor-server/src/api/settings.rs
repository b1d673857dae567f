//! Runtime endpoint and key configuration.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::info;

use parlor_core::EndpointOverrides;

use crate::error::ApiError;
use crate::state::AppState;

/// Applies a partial override of endpoint URLs and provider keys. Only
/// recognised fields are touched; a body carrying none of them is a
/// client error.
pub async fn update_endpoints(
    State(state): State<AppState>,
    Json(overrides): Json<EndpointOverrides>,
) -> Result<Json<Value>, ApiError> {
    let updated = {
        let mut config = state.config.write().await;
        config.apply_overrides(&overrides)
    };

    if updated.is_empty() {
        return Err(ApiError::bad_request(
            "No valid configuration fields provided",
        ));
    }

    info!(?updated, "endpoint configuration updated");
    Ok(Json(json!({
        "status": "success",
        "updated": updated,
    })))
}
