//! Runtime configuration: backend endpoints, API keys, storage paths.
//!
//! Everything here is read from the environment once at startup and held in
//! an `Arc<RwLock<_>>` by the server state. `POST /api/update-endpoints`
//! rewrites individual fields for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default negative prompt baked into the image workflow template.
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "text, watermark, low quality, medium quality, blurry, deformed, disfigured";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Ollama base URL (no trailing slash).
    #[serde(default = "default_ollama_api")]
    pub ollama_api: String,

    /// Kobold generate endpoint (full URL).
    #[serde(default = "default_kobold_api")]
    pub kobold_api: String,

    /// ComfyUI base URL.
    #[serde(default = "default_comfyui_api")]
    pub comfyui_api: String,

    #[serde(default)]
    pub groq_api_key: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default)]
    pub anthropic_api_key: String,
    #[serde(default)]
    pub google_api_key: String,
    #[serde(default)]
    pub xai_api_key: String,

    #[serde(default)]
    pub custom_api_endpoint: String,
    #[serde(default)]
    pub custom_api_key: String,
    #[serde(default)]
    pub custom_api_model: String,

    /// Token budget for Kobold prompt assembly.
    #[serde(default = "default_kobold_context_limit")]
    pub kobold_context_limit: usize,

    /// Directory holding one JSON file per saved chat.
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,

    /// Speech-to-text service base URL.
    #[serde(default = "default_stt_api")]
    pub stt_api: String,

    /// Text-to-speech service base URL.
    #[serde(default = "default_tts_api")]
    pub tts_api: String,

    /// TTS model selected at startup.
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ollama_api: default_ollama_api(),
            kobold_api: default_kobold_api(),
            comfyui_api: default_comfyui_api(),
            groq_api_key: String::new(),
            openai_api_key: String::new(),
            anthropic_api_key: String::new(),
            google_api_key: String::new(),
            xai_api_key: String::new(),
            custom_api_endpoint: String::new(),
            custom_api_key: String::new(),
            custom_api_model: String::new(),
            kobold_context_limit: default_kobold_context_limit(),
            history_dir: default_history_dir(),
            stt_api: default_stt_api(),
            tts_api: default_tts_api(),
            tts_model: default_tts_model(),
        }
    }
}

impl EndpointConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_var("OLLAMA_API") {
            config.ollama_api = v;
        }
        if let Some(v) = env_var("KOBOLD_API") {
            config.kobold_api = v;
        }
        if let Some(v) = env_var("COMFYUI_API") {
            config.comfyui_api = v;
        }
        if let Some(v) = env_var("GROQ_API_KEY") {
            config.groq_api_key = v;
        }
        if let Some(v) = env_var("OPENAI_API_KEY") {
            config.openai_api_key = v;
        }
        if let Some(v) = env_var("ANTHROPIC_API_KEY") {
            config.anthropic_api_key = v;
        }
        if let Some(v) = env_var("GOOGLE_API_KEY") {
            config.google_api_key = v;
        }
        if let Some(v) = env_var("XAI_API_KEY") {
            config.xai_api_key = v;
        }
        if let Some(v) = env_var("CUSTOM_API_ENDPOINT") {
            config.custom_api_endpoint = v;
        }
        if let Some(v) = env_var("CUSTOM_API_KEY") {
            config.custom_api_key = v;
        }
        if let Some(v) = env_var("CUSTOM_API_MODEL_NAME") {
            config.custom_api_model = v;
        }
        if let Some(v) = env_var("KOBOLD_CONTEXT_LIMIT") {
            if let Ok(limit) = v.parse() {
                config.kobold_context_limit = limit;
            }
        }
        if let Some(v) = env_var("PARLOR_HISTORY_DIR") {
            config.history_dir = PathBuf::from(v);
        }
        if let Some(v) = env_var("STT_API") {
            config.stt_api = v;
        }
        if let Some(v) = env_var("TTS_API") {
            config.tts_api = v;
        }
        if let Some(v) = env_var("TTS_MODEL") {
            config.tts_model = v;
        }
        config
    }

    /// Applies the fields present in `overrides`. Returns the names of the
    /// fields that were actually updated (empty when nothing matched).
    pub fn apply_overrides(&mut self, overrides: &EndpointOverrides) -> Vec<&'static str> {
        let mut updated = Vec::new();
        macro_rules! take {
            ($src:ident, $dst:ident, $name:literal) => {
                if let Some(value) = overrides.$src.clone() {
                    self.$dst = value;
                    updated.push($name);
                }
            };
        }
        take!(ollama, ollama_api, "ollama");
        take!(kobold, kobold_api, "kobold");
        take!(comfyui, comfyui_api, "comfyui");
        take!(groq_api_key, groq_api_key, "groqApiKey");
        take!(openai_api_key, openai_api_key, "openaiApiKey");
        take!(anthropic_api_key, anthropic_api_key, "anthropicApiKey");
        take!(google_api_key, google_api_key, "googleApiKey");
        take!(xai_api_key, xai_api_key, "xaiApiKey");
        take!(custom_api_endpoint, custom_api_endpoint, "customApiEndpoint");
        take!(custom_api_key, custom_api_key, "customApiKey");
        take!(custom_model_name, custom_api_model, "customModelName");
        updated
    }
}

/// Partial endpoint/key update, field names matching the client payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOverrides {
    pub ollama: Option<String>,
    pub kobold: Option<String>,
    pub comfyui: Option<String>,
    pub groq_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub custom_api_endpoint: Option<String>,
    pub custom_api_key: Option<String>,
    pub custom_model_name: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn default_ollama_api() -> String {
    "http://localhost:11435".to_string()
}

fn default_kobold_api() -> String {
    "http://localhost:5001/api/v1/generate".to_string()
}

fn default_comfyui_api() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_kobold_context_limit() -> usize {
    4096
}

fn default_history_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parlor")
        .join("chat_histories")
}

fn default_stt_api() -> String {
    "http://localhost:9000".to_string()
}

fn default_tts_api() -> String {
    "http://localhost:5002".to_string()
}

fn default_tts_model() -> String {
    "tts_models/en/ljspeech/tacotron2-DDC".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_report_updated_fields() {
        let mut config = EndpointConfig::default();
        let overrides = EndpointOverrides {
            ollama: Some("http://other:11434".to_string()),
            groq_api_key: Some("gsk_test".to_string()),
            ..Default::default()
        };
        let updated = config.apply_overrides(&overrides);
        assert_eq!(updated, vec!["ollama", "groqApiKey"]);
        assert_eq!(config.ollama_api, "http://other:11434");
        assert_eq!(config.groq_api_key, "gsk_test");
    }

    #[test]
    fn empty_overrides_change_nothing() {
        let mut config = EndpointConfig::default();
        let before = config.ollama_api.clone();
        assert!(config
            .apply_overrides(&EndpointOverrides::default())
            .is_empty());
        assert_eq!(config.ollama_api, before);
    }
}
