//! Realtime voice channel.
//!
//! One WebSocket per browser tab. Inbound events drive the voice session
//! phase machine; outbound events are funnelled through a single writer
//! task so STT and TTS work can run concurrently with the read loop.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parlor_core::{audio, SpeechStatus};

use crate::state::AppState;

/// Outbound audio is chunked so the browser can begin playback before the
/// full clip has arrived.
const AUDIO_CHUNK_BYTES: usize = 8192;
const AUDIO_CHUNK_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEvent {
    GetVoiceConfig,
    SetVoiceSettings {
        #[serde(rename = "sttLanguage")]
        stt_language: Option<String>,
        #[serde(rename = "ttsSpeaker")]
        tts_speaker: Option<String>,
    },
    StartVoice {
        language: Option<String>,
    },
    StopVoice,
    AudioChunk {
        audio: String,
    },
    RequestTts {
        text: String,
        speaker: Option<String>,
        #[serde(default)]
        speed: Option<f32>,
        // Accepted for wire compatibility; no engine we target honours it.
        #[serde(default, rename = "pitch")]
        _pitch: Option<f32>,
    },
}

type EventSender = mpsc::UnboundedSender<Value>;

fn send_event(tx: &EventSender, event: Value) {
    let _ = tx.send(event);
}

fn error_event(message: impl Into<String>) -> Value {
    json!({ "type": "voice_error", "message": message.into() })
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(connection_id, "voice websocket connected");
    state.sessions.connect(&connection_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Value>();

    // Single writer task; everything outbound flows through the channel.
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = event.to_string();
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(connection_id, error = %err, "websocket read error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => handle_event(&state, &connection_id, &event_tx, event).await,
            Err(err) => {
                warn!(connection_id, error = %err, "unparseable client event");
                send_event(&event_tx, error_event("Unrecognised event"));
            }
        }
    }

    state.sessions.disconnect(&connection_id);
    drop(event_tx);
    let _ = writer.await;
    info!(connection_id, "voice websocket closed");
}

async fn handle_event(
    state: &AppState,
    connection_id: &str,
    tx: &EventSender,
    event: ClientEvent,
) {
    match event {
        ClientEvent::GetVoiceConfig => {
            send_event(tx, voice_config(state).await);
        }
        ClientEvent::SetVoiceSettings {
            stt_language,
            tts_speaker,
        } => {
            state.sessions.set_settings(
                connection_id,
                stt_language.as_deref(),
                tts_speaker.as_deref(),
            );
        }
        ClientEvent::StartVoice { language } => {
            if state.sessions.start(connection_id, language.as_deref()) {
                send_event(
                    tx,
                    json!({ "type": "voice_started", "message": "Listening..." }),
                );
            } else {
                send_event(tx, error_event("No voice session for this connection"));
            }
        }
        ClientEvent::AudioChunk { audio } => {
            match base64::engine::general_purpose::STANDARD.decode(&audio) {
                Ok(bytes) => state.sessions.push_chunk(connection_id, &bytes),
                Err(err) => {
                    debug!(connection_id, error = %err, "dropping undecodable audio chunk");
                }
            }
        }
        ClientEvent::StopVoice => {
            // A stop outside Listening is logged by the store and ignored.
            let Some(captured) = state.sessions.begin_processing(connection_id) else {
                return;
            };
            let state = state.clone();
            let tx = tx.clone();
            let connection_id = connection_id.to_string();
            tokio::spawn(async move {
                process_voice_turn(&state, &connection_id, &tx, captured).await;
                state.sessions.finish(&connection_id);
            });
        }
        ClientEvent::RequestTts {
            text,
            speaker,
            speed,
            _pitch,
        } => {
            let speaker = speaker.or_else(|| state.sessions.speaker(connection_id));
            let state = state.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                synthesize_reply(&state, &tx, &text, speaker.as_deref(), speed.unwrap_or(1.0))
                    .await;
            });
        }
    }
}

async fn voice_config(state: &AppState) -> Value {
    let config = state.config_snapshot().await;
    let status = SpeechStatus {
        stt_ready: state.stt.available(&config.stt_api).await,
        tts_ready: state.tts.available(&config.tts_api).await,
        tts_speakers: state.tts.speakers(&config.tts_api).await,
        current_tts_model: config.tts_model,
    };
    let mut event = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
    if let Some(map) = event.as_object_mut() {
        map.insert("type".to_string(), json!("voice_config"));
    }
    event
}

// TODO: let the client pick the backend/model used for voice replies
// instead of the fixed defaults below.
const VOICE_REPLY_BACKEND: &str = "ollama";
const VOICE_REPLY_MODEL: &str = "llama3";

/// The full voice turn: transcribe the capture, ask the default text
/// backend for a reply, and speak it back. Each stage that fails ends the
/// turn with a session-level event, never a dropped connection.
async fn process_voice_turn(
    state: &AppState,
    connection_id: &str,
    tx: &EventSender,
    captured: parlor_core::voice::CapturedAudio,
) {
    if captured.audio.len() < parlor_core::voice::MIN_AUDIO_BYTES {
        warn!(
            connection_id,
            bytes = captured.audio.len(),
            "audio buffer too short for transcription"
        );
        send_event(
            tx,
            json!({
                "type": "voice_result",
                "transcript": "",
                "final": true,
                "error": "Audio too short.",
            }),
        );
        return;
    }

    send_event(
        tx,
        json!({ "type": "voice_processing", "message": "Transcribing audio..." }),
    );

    let wav = match audio::convert_to_wav(&captured.audio, "webm").await {
        Ok(wav) => wav,
        Err(err) => {
            error!(connection_id, error = %err, "audio conversion failed");
            send_event(tx, error_event(format!("Audio conversion failed: {err}")));
            return;
        }
    };

    let config = state.config_snapshot().await;
    let transcription = match state
        .stt
        .transcribe(&config.stt_api, &wav, Some(&captured.language))
        .await
    {
        Ok(transcription) => transcription,
        Err(err) => {
            error!(connection_id, error = %err, "transcription failed");
            send_event(
                tx,
                json!({
                    "type": "voice_result",
                    "transcript": "",
                    "final": true,
                    "error": err.to_string(),
                }),
            );
            return;
        }
    };

    info!(connection_id, chars = transcription.text.len(), "voice transcribed");
    send_event(
        tx,
        json!({
            "type": "voice_result",
            "transcript": transcription.text,
            "final": true,
            "detected_language": transcription.detected_language,
        }),
    );

    if transcription.text.is_empty() {
        debug!(connection_id, "empty transcript, skipping reply");
        return;
    }

    send_event(
        tx,
        json!({ "type": "voice_processing", "message": "Getting AI response..." }),
    );
    let backend = match VOICE_REPLY_BACKEND.parse() {
        Ok(backend) => backend,
        Err(_) => return,
    };
    let reply = match state
        .text
        .generate(&config, backend, &transcription.text, &[], Some(VOICE_REPLY_MODEL))
        .await
    {
        Ok(reply) => reply,
        Err(err) => {
            error!(connection_id, error = %err, "voice reply generation failed");
            send_event(tx, error_event(format!("An error occurred: {err}")));
            return;
        }
    };

    if reply.is_empty() {
        debug!(connection_id, "no reply text to synthesize");
        return;
    }
    synthesize_reply(state, tx, &reply, captured.speaker.as_deref(), 1.0).await;
}

async fn synthesize_reply(
    state: &AppState,
    tx: &EventSender,
    text: &str,
    speaker: Option<&str>,
    speed: f32,
) {
    send_event(
        tx,
        json!({ "type": "voice_synthesis", "message": "Generating speech..." }),
    );

    let base_url = state.config.read().await.tts_api.clone();
    let wav = match state.tts.synthesize(&base_url, text, speaker, speed).await {
        Ok(wav) => wav,
        Err(err) => {
            error!(error = %err, "speech synthesis failed");
            send_event(tx, error_event(format!("Speech synthesis failed: {err}")));
            return;
        }
    };

    for chunk in wav.chunks(AUDIO_CHUNK_BYTES) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
        send_event(
            tx,
            json!({ "type": "voice_audio_chunk", "audio": encoded }),
        );
        // Let the writer drain between chunks so playback starts promptly.
        tokio::time::sleep(AUDIO_CHUNK_PAUSE).await;
    }
    send_event(tx, json!({ "type": "voice_speak_end" }));
}
