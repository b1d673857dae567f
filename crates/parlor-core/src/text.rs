//! Text generation coordinator.
//!
//! Translates one `(prompt, history, backend, model)` request into the
//! selected provider's wire schema, calls it through the upstream client,
//! and decodes the provider-specific response shape back into plain text.
//! History arrives newest-first from the client and every provider wants
//! oldest-first, so the coordinator reverses it before appending the new
//! prompt as the most recent turn.
//!
//! Streaming is offered for Ollama only; every other backend is buffered.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::registry::TaskRegistry;
use crate::upstream::{UpstreamBody, UpstreamClient};

const BUFFERED_TIMEOUT: Duration = Duration::from_secs(180);
const STREAM_TIMEOUT: Duration = Duration::from_secs(300);
const ANTHROPIC_MAX_TOKENS: u32 = 1024;
const KOBOLD_GENERATION_LENGTH: usize = 512;
/// Rough chars-per-token estimate used for the Kobold context budget.
const KOBOLD_CHARS_PER_TOKEN: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

fn default_role() -> String {
    "user".to_string()
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextBackend {
    Ollama,
    Kobold,
    Groq,
    OpenAi,
    Anthropic,
    Google,
    Xai,
    Custom,
}

impl TextBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextBackend::Ollama => "ollama",
            TextBackend::Kobold => "kobold",
            TextBackend::Groq => "groq",
            TextBackend::OpenAi => "openai",
            TextBackend::Anthropic => "anthropic",
            TextBackend::Google => "google",
            TextBackend::Xai => "xai",
            TextBackend::Custom => "custom_external",
        }
    }

    /// Whether this backend supports incremental delivery.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, TextBackend::Ollama)
    }
}

impl fmt::Display for TextBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ollama" => Ok(TextBackend::Ollama),
            "kobold" => Ok(TextBackend::Kobold),
            "groq" => Ok(TextBackend::Groq),
            "openai" => Ok(TextBackend::OpenAi),
            "anthropic" => Ok(TextBackend::Anthropic),
            "google" => Ok(TextBackend::Google),
            "xai" => Ok(TextBackend::Xai),
            "custom_external" => Ok(TextBackend::Custom),
            other => Err(Error::validation(format!(
                "Backend '{other}' not supported"
            ))),
        }
    }
}

/// A fully assembled upstream request for one backend.
#[derive(Debug)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub payload: Value,
}

/// Reverses newest-first history into chronological order and appends the
/// new prompt as the latest user turn.
pub fn build_messages(prompt: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = history.iter().rev().cloned().collect();
    messages.push(ChatMessage::user(prompt));
    messages
}

/// Builds the Kobold plain-text transcript, newest turns first, working
/// backward through history until the character budget is exhausted. The
/// current prompt and the trailing trigger phrase are never truncated.
pub fn format_kobold_prompt(prompt: &str, history: &[ChatMessage], context_limit: usize) -> String {
    const TRIGGER: &str = "Assistant:";
    let budget = context_limit * KOBOLD_CHARS_PER_TOKEN;

    let mut lines: Vec<String> = Vec::new();
    let prompt_line = format!("User: {}", prompt.trim());
    let mut used = prompt_line.len();
    lines.push(prompt_line);

    // History is newest-first already, so iterating forward walks backward
    // in time; each surviving line is inserted before the ones we have.
    for message in history {
        let content = message.content.trim();
        let line = match message.role.as_str() {
            "assistant" => format!("{TRIGGER} {content}"),
            "user" => format!("User: {content}"),
            _ => content.to_string(),
        };
        if used + line.len() >= budget {
            warn!("kobold history truncated at {used} of {budget} chars");
            break;
        }
        used += line.len();
        lines.insert(0, line);
    }

    lines.push(TRIGGER.to_string());
    lines.join("\n")
}

fn openai_style_messages(messages: &[ChatMessage]) -> Value {
    json!(messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect::<Vec<_>>())
}

/// Builds the backend-specific payload, endpoint and headers. Missing keys
/// and endpoints surface as configuration errors; missing models for
/// hosted providers as validation errors.
pub fn build_request(
    backend: TextBackend,
    prompt: &str,
    history: &[ChatMessage],
    model: Option<&str>,
    config: &EndpointConfig,
) -> Result<PreparedRequest> {
    let messages = build_messages(prompt, history);
    let require_model = || {
        model
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::validation(format!("Model name required for {backend}")))
    };
    let require_key = |key: &str, name: &str| {
        if key.is_empty() {
            Err(Error::configuration(format!(
                "{name} API Key not configured on backend"
            )))
        } else {
            Ok(key.to_string())
        }
    };

    match backend {
        TextBackend::Ollama => {
            let model = require_model()?;
            Ok(PreparedRequest {
                url: format!("{}/api/chat", config.ollama_api),
                headers: vec![],
                payload: json!({
                    "model": model,
                    "messages": openai_style_messages(&messages),
                    "stream": false,
                }),
            })
        }
        TextBackend::Kobold => {
            let formatted = format_kobold_prompt(prompt, history, config.kobold_context_limit);
            let prompt_tokens = formatted.len() / KOBOLD_CHARS_PER_TOKEN;
            let max_length =
                (prompt_tokens + KOBOLD_GENERATION_LENGTH).min(config.kobold_context_limit);
            Ok(PreparedRequest {
                url: config.kobold_api.clone(),
                headers: vec![],
                payload: json!({
                    "prompt": formatted,
                    "max_length": max_length,
                    "temperature": 0.7,
                }),
            })
        }
        TextBackend::Groq => {
            let key = require_key(&config.groq_api_key, "Groq")?;
            let model = require_model()?;
            Ok(PreparedRequest {
                url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
                headers: vec![("authorization", format!("Bearer {key}"))],
                payload: json!({
                    "messages": openai_style_messages(&messages),
                    "model": model,
                    "stream": false,
                }),
            })
        }
        TextBackend::OpenAi => {
            let key = require_key(&config.openai_api_key, "OpenAI")?;
            let model = require_model()?;
            Ok(PreparedRequest {
                url: "https://api.openai.com/v1/chat/completions".to_string(),
                headers: vec![("authorization", format!("Bearer {key}"))],
                payload: json!({
                    "messages": openai_style_messages(&messages),
                    "model": model,
                    "stream": false,
                }),
            })
        }
        TextBackend::Anthropic => {
            let key = require_key(&config.anthropic_api_key, "Anthropic")?;
            let model = require_model()?;
            Ok(PreparedRequest {
                url: "https://api.anthropic.com/v1/messages".to_string(),
                headers: vec![
                    ("x-api-key", key),
                    ("anthropic-version", "2023-06-01".to_string()),
                ],
                payload: json!({
                    "model": model,
                    "messages": openai_style_messages(&messages),
                    "max_tokens": ANTHROPIC_MAX_TOKENS,
                    "stream": false,
                }),
            })
        }
        TextBackend::Google => {
            let model = require_model()?;
            let key = require_key(&config.google_api_key, "Google")?;
            let contents: Vec<Value> = messages
                .iter()
                .map(|m| {
                    let role = if m.role == "assistant" { "model" } else { "user" };
                    json!({"role": role, "parts": [{"text": m.content}]})
                })
                .collect();
            Ok(PreparedRequest {
                url: format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent?key={key}"
                ),
                headers: vec![],
                payload: json!({ "contents": contents }),
            })
        }
        TextBackend::Xai => {
            let key = require_key(&config.xai_api_key, "xAI")?;
            let model = require_model()?;
            Ok(PreparedRequest {
                url: "https://api.x.ai/v1/chat/completions".to_string(),
                headers: vec![("authorization", format!("Bearer {key}"))],
                payload: json!({
                    "messages": openai_style_messages(&messages),
                    "model": model,
                    "stream": false,
                }),
            })
        }
        TextBackend::Custom => {
            if config.custom_api_endpoint.is_empty() {
                return Err(Error::configuration("Custom API Endpoint not configured"));
            }
            if config.custom_api_model.is_empty() {
                return Err(Error::configuration("Custom API Model Name not configured"));
            }
            let mut headers = Vec::new();
            if !config.custom_api_key.is_empty() {
                headers.push((
                    "authorization",
                    format!("Bearer {}", config.custom_api_key),
                ));
            }
            Ok(PreparedRequest {
                url: config.custom_api_endpoint.clone(),
                headers,
                payload: json!({
                    "messages": openai_style_messages(&messages),
                    "model": config.custom_api_model,
                    "stream": false,
                }),
            })
        }
    }
}

/// Extracts the reply text from the backend-specific response shape,
/// falling back to the generic `response`/`text`/`completion` keys and
/// finally accepting a plain-text body as-is.
pub fn decode_response(backend: TextBackend, body: &UpstreamBody) -> Result<String> {
    let value = match body {
        UpstreamBody::Json(value) => value,
        UpstreamBody::Text(text) => {
            warn!(backend = %backend, "backend returned plain text instead of JSON");
            return Ok(text.trim().to_string());
        }
        UpstreamBody::Empty => {
            return Err(Error::upstream(
                None,
                format!("empty response from {backend}"),
            ))
        }
    };

    let extracted = match backend {
        TextBackend::Groq | TextBackend::OpenAi | TextBackend::Xai | TextBackend::Custom => {
            value.pointer("/choices/0/message/content")
        }
        TextBackend::Anthropic => value.pointer("/content/0/text"),
        TextBackend::Google => value.pointer("/candidates/0/content/parts/0/text"),
        TextBackend::Kobold => value.pointer("/results/0/text"),
        TextBackend::Ollama => value
            .pointer("/message/content")
            .or_else(|| value.get("response")),
    }
    .and_then(Value::as_str);

    let text = extracted.or_else(|| {
        warn!(backend = %backend, "unknown response shape, trying generic keys");
        ["response", "text", "completion"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
    });

    match text {
        Some(text) => Ok(text.trim().to_string()),
        None => Err(Error::upstream(
            None,
            format!("could not parse response from {backend}"),
        )),
    }
}

/// One decoded event from an Ollama chat stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta: Option<String>,
    pub done: bool,
}

/// Incremental decoder for a stream of concatenated JSON objects.
///
/// Upstream chunks can split an object at any byte, so undecodable
/// remainders stay buffered until the next read completes them.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and drains every complete JSON object currently in
    /// the buffer.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        let mut consumed = 0;
        {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        consumed = stream.byte_offset();
                        chunks.push(Self::interpret(&value));
                    }
                    Some(Err(err)) if err.is_eof() => break,
                    Some(Err(err)) => {
                        // Corrupt frame: drop the buffer rather than stall
                        // the stream on bytes that will never parse.
                        warn!("discarding undecodable stream buffer: {err}");
                        consumed = self.buffer.len();
                        break;
                    }
                    None => break,
                }
            }
        }
        self.buffer.drain(..consumed);
        chunks
    }

    fn interpret(value: &Value) -> StreamChunk {
        let delta = value
            .pointer("/message/content")
            .or_else(|| value.get("response"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
        StreamChunk { delta, done }
    }
}

/// How a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEvent {
    /// Upstream signalled completion (`done: true`) or the stream ended.
    Finished,
    /// The task was cancelled via the registry while streaming.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TextCoordinator {
    upstream: UpstreamClient,
}

impl TextCoordinator {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    /// Buffered mode: one upstream call, one decoded string.
    pub async fn generate(
        &self,
        config: &EndpointConfig,
        backend: TextBackend,
        prompt: &str,
        history: &[ChatMessage],
        model: Option<&str>,
    ) -> Result<String> {
        let request = build_request(backend, prompt, history, model, config)?;
        info!(backend = %backend, url = %request.url, "buffered text generation");
        let body = self
            .upstream
            .request(
                Method::POST,
                &request.url,
                Some(&request.payload),
                &request.headers,
                BUFFERED_TIMEOUT,
            )
            .await?;
        decode_response(backend, &body)
    }

    /// Streaming mode (Ollama only). Opens the upstream stream, relays each
    /// decoded delta through `on_delta`, and stops on upstream completion,
    /// stream end, or cooperative cancellation via the registry. The task
    /// entry is removed and the connection dropped on every exit path.
    pub async fn stream_ollama(
        &self,
        registry: &TaskRegistry,
        client_id: &str,
        config: &EndpointConfig,
        model: &str,
        prompt: &str,
        history: &[ChatMessage],
        on_delta: impl FnMut(String),
    ) -> Result<TextEvent> {
        let result = self
            .stream_ollama_inner(registry, client_id, config, model, prompt, history, on_delta)
            .await;
        registry.complete(client_id);
        result
    }

    async fn stream_ollama_inner(
        &self,
        registry: &TaskRegistry,
        client_id: &str,
        config: &EndpointConfig,
        model: &str,
        prompt: &str,
        history: &[ChatMessage],
        mut on_delta: impl FnMut(String),
    ) -> Result<TextEvent> {
        let messages = build_messages(prompt, history);
        let payload = json!({
            "model": model,
            "messages": openai_style_messages(&messages),
            "stream": true,
        });
        let url = format!("{}/api/chat", config.ollama_api);
        let headers = [("x-client-id", client_id.to_string())];

        info!(client_id, url = %url, "opening ollama stream");
        let mut response = self
            .upstream
            .request_stream(Method::POST, &url, Some(&payload), &headers, STREAM_TIMEOUT, 1)
            .await?;

        // The client may have cancelled while the connection was being
        // established; in that window only the registry entry existed.
        let Some(token) = registry.cancellation_token(client_id) else {
            info!(client_id, "task cancelled before the stream was attached");
            return Ok(TextEvent::Cancelled);
        };

        let mut decoder = StreamDecoder::new();
        loop {
            if !registry.is_active(client_id) {
                info!(client_id, "cancellation detected mid-stream");
                return Ok(TextEvent::Cancelled);
            }

            let chunk = tokio::select! {
                _ = token.cancelled() => {
                    info!(client_id, "stream token cancelled");
                    return Ok(TextEvent::Cancelled);
                }
                chunk = response.chunk() => {
                    chunk.map_err(|err| Error::Transport(err.to_string()))?
                }
            };

            let Some(bytes) = chunk else {
                debug!(client_id, "upstream stream ended");
                return Ok(TextEvent::Finished);
            };

            for decoded in decoder.push(&bytes) {
                if let Some(delta) = decoded.delta {
                    on_delta(delta);
                }
                if decoded.done {
                    info!(client_id, "ollama stream signalled done");
                    return Ok(TextEvent::Finished);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newest_first_history() -> Vec<ChatMessage> {
        vec![ChatMessage::user("b"), ChatMessage::user("a")]
    }

    #[test]
    fn history_is_reversed_and_prompt_appended() {
        let messages = build_messages("c", &newest_first_history());
        let order: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn ollama_payload_orders_messages_chronologically() {
        let config = EndpointConfig::default();
        let request = build_request(
            TextBackend::Ollama,
            "c",
            &newest_first_history(),
            Some("llama3"),
            &config,
        )
        .unwrap();
        let contents: Vec<&str> = request.payload["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
        assert_eq!(request.payload["stream"], json!(false));
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let config = EndpointConfig::default();
        let err = build_request(TextBackend::OpenAi, "hi", &[], Some("gpt-4o"), &config)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn anthropic_request_uses_api_key_header_and_token_cap() {
        let config = EndpointConfig {
            anthropic_api_key: "sk-ant-test".to_string(),
            ..Default::default()
        };
        let request = build_request(
            TextBackend::Anthropic,
            "hi",
            &[],
            Some("claude-3-haiku"),
            &config,
        )
        .unwrap();
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| *name == "x-api-key" && value == "sk-ant-test"));
        assert_eq!(request.payload["max_tokens"], json!(ANTHROPIC_MAX_TOKENS));
    }

    #[test]
    fn google_maps_assistant_role_to_model() {
        let config = EndpointConfig {
            google_api_key: "key".to_string(),
            ..Default::default()
        };
        let history = vec![ChatMessage::assistant("earlier reply")];
        let request =
            build_request(TextBackend::Google, "hi", &history, Some("gemini-pro"), &config)
                .unwrap();
        let contents = request.payload["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], json!("model"));
        assert_eq!(contents[1]["parts"][0]["text"], json!("hi"));
    }

    #[test]
    fn kobold_prompt_keeps_newest_turns_and_trigger() {
        let history = vec![
            ChatMessage::assistant("newest reply"),
            ChatMessage::user("older question"),
        ];
        let prompt = format_kobold_prompt("now", &history, 4096);
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(
            lines,
            vec![
                "User: older question",
                "Assistant: newest reply",
                "User: now",
                "Assistant:",
            ]
        );
    }

    #[test]
    fn kobold_prompt_truncates_oldest_history_first() {
        let history = vec![
            ChatMessage::user("recent"),
            ChatMessage::user("x".repeat(400)),
        ];
        // Budget of 50 tokens * 3 chars keeps the prompt and the recent turn
        // but not the 400-char turn behind it.
        let prompt = format_kobold_prompt("now", &history, 50);
        assert!(prompt.contains("User: recent"));
        assert!(!prompt.contains(&"x".repeat(400)));
        assert!(prompt.ends_with("Assistant:"));
        assert!(prompt.contains("User: now"));
    }

    #[test]
    fn decode_covers_each_backend_shape() {
        let cases = [
            (
                TextBackend::OpenAi,
                json!({"choices": [{"message": {"content": " hi "}}]}),
            ),
            (
                TextBackend::Anthropic,
                json!({"content": [{"type": "text", "text": "hi"}]}),
            ),
            (
                TextBackend::Google,
                json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]}),
            ),
            (TextBackend::Kobold, json!({"results": [{"text": "hi"}]})),
            (
                TextBackend::Ollama,
                json!({"message": {"role": "assistant", "content": "hi"}}),
            ),
        ];
        for (backend, body) in cases {
            let decoded = decode_response(backend, &UpstreamBody::Json(body)).unwrap();
            assert_eq!(decoded, "hi", "backend {backend}");
        }
    }

    #[test]
    fn decode_falls_back_to_generic_keys_and_plain_text() {
        let decoded = decode_response(
            TextBackend::OpenAi,
            &UpstreamBody::Json(json!({"completion": "fallback"})),
        )
        .unwrap();
        assert_eq!(decoded, "fallback");

        let decoded =
            decode_response(TextBackend::Kobold, &UpstreamBody::Text(" raw ".to_string()))
                .unwrap();
        assert_eq!(decoded, "raw");

        assert!(decode_response(TextBackend::OpenAi, &UpstreamBody::Empty).is_err());
    }

    #[test]
    fn unknown_backend_name_is_rejected() {
        assert!(matches!(
            "mystery".parse::<TextBackend>(),
            Err(Error::Validation(_))
        ));
        assert_eq!(
            "custom_external".parse::<TextBackend>().unwrap(),
            TextBackend::Custom
        );
    }

    #[test]
    fn stream_decoder_reassembles_an_object_split_across_reads() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(br#"{"response":"He"#).is_empty());
        let chunks = decoder.push(br#"llo"}"#);
        assert_eq!(
            chunks,
            vec![StreamChunk {
                delta: Some("Hello".to_string()),
                done: false,
            }]
        );
    }

    #[test]
    fn stream_decoder_drains_multiple_objects_per_read() {
        let mut decoder = StreamDecoder::new();
        let chunks = decoder.push(
            br#"{"message":{"content":"a"}} {"message":{"content":"b"},"done":true}"#,
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].delta.as_deref(), Some("a"));
        assert!(chunks[1].done);
    }

    #[test]
    fn stream_decoder_handles_utf8_split_inside_a_character() {
        let bytes = r#"{"response":"héllo"}"#.as_bytes();
        // Split in the middle of the two-byte 'é'.
        let split = bytes.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let mut decoder = StreamDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let chunks = decoder.push(&bytes[split..]);
        assert_eq!(chunks[0].delta.as_deref(), Some("héllo"));
    }
}
