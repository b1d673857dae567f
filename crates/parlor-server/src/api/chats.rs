//! Chat history CRUD.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use parlor_core::ChatRecord;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_chats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let chats = state.chats.list()?;
    Ok(Json(json!({
        "status": "success",
        "chats": chats,
    })))
}

pub async fn load_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.chats.load(&chat_id)?;
    Ok(Json(json!({
        "status": "success",
        "messages": record.messages,
        "images": record.images,
    })))
}

pub async fn save_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    // Both keys must be present so a truncated client payload cannot
    // silently wipe half the record.
    let (Some(messages), Some(images)) = (body.get("messages"), body.get("images")) else {
        return Err(ApiError::bad_request(
            "Request body must contain 'messages' and 'images'",
        ));
    };
    let messages = messages
        .as_array()
        .ok_or_else(|| ApiError::bad_request("'messages' must be a list"))?;
    let images = images
        .as_array()
        .ok_or_else(|| ApiError::bad_request("'images' must be a list"))?;

    let record = ChatRecord {
        messages: messages.clone(),
        images: images.clone(),
    };
    state.chats.save(&chat_id, &record)?;
    info!(chat_id, messages = record.messages.len(), "chat saved");

    Ok(Json(json!({ "status": "success" })))
}

/// Deleting a chat that does not exist is still a success; the desired
/// state holds either way.
pub async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.chats.delete(&chat_id)?;
    let message = if removed {
        "Chat deleted"
    } else {
        "Chat did not exist"
    };
    Ok(Json(json!({
        "status": "success",
        "message": message,
    })))
}
