//! Shared application state

use std::sync::Arc;

use tokio::sync::RwLock;

use parlor_core::{
    ChatStore, EndpointConfig, ImageCoordinator, SttClient, TaskRegistry, TextCoordinator,
    TtsClient, UpstreamClient, VoiceSessionStore,
};

/// Everything a handler needs, injected through axum state. Cloning is
/// cheap; all mutable pieces sit behind their own lock.
#[derive(Clone)]
pub struct AppState {
    /// Endpoint URLs and provider keys, mutable at runtime via the
    /// settings route.
    pub config: Arc<RwLock<EndpointConfig>>,
    pub upstream: UpstreamClient,
    pub text: TextCoordinator,
    pub image: ImageCoordinator,
    pub stt: SttClient,
    pub tts: TtsClient,
    pub tasks: Arc<TaskRegistry>,
    pub sessions: Arc<VoiceSessionStore>,
    pub chats: Arc<ChatStore>,
}

impl AppState {
    pub fn new(config: EndpointConfig) -> Self {
        let upstream = UpstreamClient::new();
        let chats = Arc::new(ChatStore::new(config.history_dir.clone()));

        Self {
            config: Arc::new(RwLock::new(config)),
            text: TextCoordinator::new(upstream.clone()),
            image: ImageCoordinator::new(upstream.clone()),
            stt: SttClient::new(upstream.clone()),
            tts: TtsClient::new(upstream.clone()),
            upstream,
            tasks: Arc::new(TaskRegistry::new()),
            sessions: Arc::new(VoiceSessionStore::new()),
            chats,
        }
    }

    /// Snapshot of the current endpoint configuration.
    pub async fn config_snapshot(&self) -> EndpointConfig {
        self.config.read().await.clone()
    }
}
