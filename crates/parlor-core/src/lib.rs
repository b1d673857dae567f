//! Parlor Core - coordination logic for a multi-backend chat server
//!
//! This crate mediates between one browser client and several external
//! generation services: text LLMs (local and hosted), a ComfyUI render
//! queue, and speech-to-text / text-to-speech engines. The server crate
//! wires these pieces to an HTTP/WebSocket surface.
//!
//! The concurrency core is [`registry::TaskRegistry`]: a lock-guarded map
//! of in-flight generation tasks keyed by client id, which lets a cancel
//! request arriving on a different connection tear down a streaming
//! response or an image render already in progress.

pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod image;
pub mod registry;
pub mod speech;
pub mod text;
pub mod upstream;
pub mod voice;

pub use config::{EndpointConfig, EndpointOverrides};
pub use error::{Error, Result};
pub use history::{ChatRecord, ChatStore, ChatSummary};
pub use image::{apply_settings, default_workflow, ImageCoordinator, ImageOutcome, ImageSettings};
pub use registry::{TaskKind, TaskRegistry, TaskSnapshot};
pub use speech::{SpeechStatus, SttClient, Transcription, TtsClient};
pub use text::{ChatMessage, TextBackend, TextCoordinator, TextEvent};
pub use upstream::{UpstreamBody, UpstreamClient};
pub use voice::{VoicePhase, VoiceSessionStore};
