//! Text generation endpoint, buffered and streaming.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{sse::Event, IntoResponse, Response, Sse},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use parlor_core::{ChatMessage, TaskKind, TextBackend, TextEvent};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    pub backend: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Prior turns, newest first, as the client stores them.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateQuery {
    #[serde(default)]
    pub stream: bool,
}

/// Events relayed from the streaming worker to the SSE writer.
enum StreamFrame {
    Delta(String),
    Done,
    Error(String),
}

fn client_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub async fn generate(
    State(state): State<AppState>,
    Query(query): Query<GenerateQuery>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("No prompt provided"));
    }
    let backend: TextBackend = req.backend.parse().map_err(ApiError::from)?;
    let client_id = client_id_from_headers(&headers);

    if query.stream && backend.supports_streaming() {
        return stream_response(state, backend, client_id, req).await;
    }
    if query.stream {
        info!(backend = %backend, "streaming not supported, falling back to buffered");
    }

    buffered_response(state, backend, client_id, req).await
}

async fn buffered_response(
    state: AppState,
    backend: TextBackend,
    client_id: String,
    req: GenerateRequest,
) -> Result<Response, ApiError> {
    let config = state.config_snapshot().await;
    let token = state.tasks.register(&client_id, TaskKind::Text { backend });

    let result = tokio::select! {
        _ = token.cancelled() => None,
        result = state.text.generate(
            &config,
            backend,
            &req.prompt,
            &req.history,
            req.model.as_deref(),
        ) => Some(result),
    };
    state.tasks.complete(&client_id);

    match result {
        None => {
            info!(client_id, "buffered generation cancelled");
            Ok(Json(json!({ "status": "cancelled" })).into_response())
        }
        Some(Ok(text)) => Ok(Json(json!({
            "status": "success",
            "response": text,
        }))
        .into_response()),
        Some(Err(err)) => {
            error!(client_id, backend = %backend, error = %err, "generation failed");
            Err(err.into())
        }
    }
}

async fn stream_response(
    state: AppState,
    backend: TextBackend,
    client_id: String,
    req: GenerateRequest,
) -> Result<Response, ApiError> {
    let config = state.config_snapshot().await;
    let model = req
        .model
        .clone()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::bad_request("Model name required for ollama"))?;

    state.tasks.register(&client_id, TaskKind::Text { backend });

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<StreamFrame>();
    let worker_state = state.clone();
    let worker_id = client_id.clone();

    tokio::spawn(async move {
        let delta_tx = frame_tx.clone();
        let outcome = worker_state
            .text
            .stream_ollama(
                &worker_state.tasks,
                &worker_id,
                &config,
                &model,
                &req.prompt,
                &req.history,
                move |delta| {
                    let _ = delta_tx.send(StreamFrame::Delta(delta));
                },
            )
            .await;

        match outcome {
            Ok(TextEvent::Finished) => {
                let _ = frame_tx.send(StreamFrame::Done);
            }
            Ok(TextEvent::Cancelled) => {
                info!(client_id = worker_id, "stream cancelled by client");
                let _ = frame_tx.send(StreamFrame::Done);
            }
            Err(err) => {
                error!(client_id = worker_id, error = %err, "stream failed");
                let _ = frame_tx.send(StreamFrame::Error(err.to_string()));
            }
        }
    });

    let stream = async_stream::stream! {
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                StreamFrame::Delta(delta) => {
                    let payload = json!({ "response": delta }).to_string();
                    yield Ok::<_, std::convert::Infallible>(Event::default().data(payload));
                }
                StreamFrame::Error(message) => {
                    let payload = json!({
                        "status": "error",
                        "message": message,
                    })
                    .to_string();
                    yield Ok(Event::default().data(payload));
                    yield Ok(Event::default().data("[DONE]"));
                    break;
                }
                StreamFrame::Done => {
                    yield Ok(Event::default().data("[DONE]"));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(axum::response::sse::KeepAlive::default())
        .into_response())
}
