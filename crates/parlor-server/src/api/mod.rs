//! API routes and handlers

mod cancel;
mod chats;
mod generate;
mod image;
mod models;
mod settings;
mod tts;
mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Text generation
        .route("/generate", post(generate::generate))
        .route("/cancel", post(cancel::cancel))
        // Chat history
        .route("/chats", get(chats::list_chats))
        .route(
            "/chat/:chat_id",
            get(chats::load_chat)
                .post(chats::save_chat)
                .delete(chats::delete_chat),
        )
        // Image generation (ComfyUI)
        .route("/comfyui-status", get(image::comfyui_status))
        .route("/comfyui-checkpoints", get(image::comfyui_checkpoints))
        .route("/generate-image", post(image::generate_image))
        // Model discovery
        .route("/models", get(models::ollama_models))
        .route("/external-models", get(models::external_models))
        // Runtime configuration
        .route("/update-endpoints", post(settings::update_endpoints))
        // Text-to-speech
        .route("/tts/models", get(tts::list_models))
        .route("/tts/set-model", post(tts::set_model))
        .route("/tts/sample", post(tts::sample));

    Router::new()
        .nest("/api", api_routes)
        // Realtime voice channel
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
