//! Speech-to-text and text-to-speech engine clients.
//!
//! The engines themselves are external collaborators reached over HTTP;
//! this module only knows their interface boundary: post audio, get a
//! transcript; post text, get audio. Speaker discovery is best-effort
//! capability probing over an ordered list of response shapes, returning
//! empty on total failure rather than guessing.

use std::time::Duration;

use base64::Engine as _;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::upstream::{UpstreamBody, UpstreamClient};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(120);
const SYNTHESIZE_TIMEOUT: Duration = Duration::from_secs(120);

/// TTS models offered even when the engine's own listing is unreachable.
pub const DEFAULT_TTS_MODELS: &[&str] = &[
    "tts_models/multilingual/multi-dataset/xtts_v2",
    "tts_models/multilingual/multi-dataset/your_tts",
    "tts_models/en/ljspeech/tacotron2-DDC",
    "tts_models/en/jenny/jenny",
    "tts_models/en/vctk/vits",
];

/// Ordered fallback probes for locating a speaker list in an engine reply.
const SPEAKER_PROBES: &[&str] = &[
    "/speakers",
    "/speaker_ids",
    "/voices",
    "/data/speakers",
    "/model/speakers",
];

#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub detected_language: Option<String>,
}

/// Capabilities snapshot sent to clients as the `voice_config` event.
#[derive(Debug, Clone, Serialize)]
pub struct SpeechStatus {
    pub stt_ready: bool,
    pub tts_ready: bool,
    pub tts_speakers: Vec<String>,
    pub current_tts_model: String,
}

#[derive(Debug, Clone)]
pub struct SttClient {
    upstream: UpstreamClient,
}

impl SttClient {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    pub async fn available(&self, base_url: &str) -> bool {
        self.upstream
            .request_with_retries(
                Method::GET,
                &format!("{base_url}/health"),
                None,
                &[],
                PROBE_TIMEOUT,
                1,
            )
            .await
            .is_ok()
    }

    /// Posts canonical WAV audio for transcription.
    pub async fn transcribe(
        &self,
        base_url: &str,
        wav: &[u8],
        language: Option<&str>,
    ) -> Result<Transcription> {
        let payload = json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(wav),
            // "auto" means let the engine detect the language itself.
            "language": language.filter(|l| *l != "auto"),
        });
        let body = self
            .upstream
            .request(
                Method::POST,
                &format!("{base_url}/transcribe"),
                Some(&payload),
                &[],
                TRANSCRIBE_TIMEOUT,
            )
            .await?;
        let value = body
            .as_json()
            .ok_or_else(|| Error::upstream(None, "transcription engine returned no JSON"))?;
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let detected_language = value
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string);
        info!(chars = text.len(), ?detected_language, "transcription complete");
        Ok(Transcription {
            text,
            detected_language,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TtsClient {
    upstream: UpstreamClient,
}

impl TtsClient {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    pub async fn available(&self, base_url: &str) -> bool {
        self.upstream
            .request_with_retries(
                Method::GET,
                &format!("{base_url}/health"),
                None,
                &[],
                PROBE_TIMEOUT,
                1,
            )
            .await
            .is_ok()
    }

    /// The engine's model listing merged with the built-in defaults; the
    /// defaults alone when the engine cannot be reached.
    pub async fn list_models(&self, base_url: &str) -> Vec<String> {
        let fetched = match self
            .upstream
            .request_with_retries(
                Method::GET,
                &format!("{base_url}/models"),
                None,
                &[],
                METADATA_TIMEOUT,
                2,
            )
            .await
        {
            Ok(body) => body
                .as_json()
                .and_then(|v| v.get("models"))
                .and_then(Value::as_array)
                .map(|models| {
                    models
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "TTS model listing unavailable, using defaults");
                Vec::new()
            }
        };
        merge_model_lists(fetched)
    }

    /// Asks the engine to switch models. Returns the speaker list of the
    /// newly loaded model.
    pub async fn set_model(&self, base_url: &str, model_name: &str) -> Result<Vec<String>> {
        let payload = json!({ "model_name": model_name });
        let body = self
            .upstream
            .request(
                Method::POST,
                &format!("{base_url}/set-model"),
                Some(&payload),
                &[],
                // Model loading can be slow.
                Duration::from_secs(180),
            )
            .await?;
        info!(model_name, "TTS model switched");
        Ok(body.as_json().map(probe_speakers).unwrap_or_default())
    }

    /// Best-effort speaker discovery for the currently loaded model.
    pub async fn speakers(&self, base_url: &str) -> Vec<String> {
        match self
            .upstream
            .request_with_retries(
                Method::GET,
                &format!("{base_url}/speakers"),
                None,
                &[],
                METADATA_TIMEOUT,
                1,
            )
            .await
        {
            Ok(UpstreamBody::Json(value)) => probe_speakers(&value),
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "speaker discovery failed");
                Vec::new()
            }
        }
    }

    /// Synthesizes speech, returning WAV bytes. Empty output is an error
    /// the caller may treat as soft.
    pub async fn synthesize(
        &self,
        base_url: &str,
        text: &str,
        speaker: Option<&str>,
        speed: f32,
    ) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(Error::validation("No text provided for TTS"));
        }
        let payload = json!({
            "text": text,
            "speaker": speaker,
            "speed": speed,
        });
        let body = self
            .upstream
            .request(
                Method::POST,
                &format!("{base_url}/synthesize"),
                Some(&payload),
                &[],
                SYNTHESIZE_TIMEOUT,
            )
            .await?;
        let value = body
            .as_json()
            .ok_or_else(|| Error::Audio("TTS engine returned no audio".to_string()))?;
        let wav = decode_audio_reply(value)?;
        if wav.is_empty() {
            return Err(Error::Audio(
                "TTS generation resulted in empty audio".to_string(),
            ));
        }
        Ok(wav)
    }
}

/// Engines reply either with base64 WAV under `audio`, or with raw float
/// samples under `samples` (plus a `sample_rate`), which we encode
/// ourselves.
fn decode_audio_reply(value: &Value) -> Result<Vec<u8>> {
    if let Some(encoded) = value.get("audio").and_then(Value::as_str) {
        return base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| Error::Audio(format!("TTS audio was not valid base64: {err}")));
    }
    if let Some(raw) = value.get("samples").and_then(Value::as_array) {
        let samples: Vec<f32> = raw
            .iter()
            .filter_map(Value::as_f64)
            .map(|s| s as f32)
            .collect();
        let sample_rate = value
            .get("sample_rate")
            .and_then(Value::as_u64)
            .map(|r| r as u32)
            .unwrap_or(crate::audio::CANONICAL_SAMPLE_RATE);
        return crate::audio::samples_to_wav(&samples, sample_rate);
    }
    Err(Error::Audio(
        "TTS engine reply had neither audio nor samples".to_string(),
    ))
}

/// Walks the ordered probes until one yields a list of strings. Total
/// failure is an empty list, never an error.
pub fn probe_speakers(value: &Value) -> Vec<String> {
    for probe in SPEAKER_PROBES {
        if let Some(items) = value.pointer(probe).and_then(Value::as_array) {
            let speakers: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !speakers.is_empty() {
                return speakers;
            }
        }
    }
    Vec::new()
}

fn merge_model_lists(fetched: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = fetched;
    for default in DEFAULT_TTS_MODELS {
        if !merged.iter().any(|m| m == default) {
            merged.push(default.to_string());
        }
    }
    merged.sort();
    merged.dedup();
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_fall_through_in_order() {
        let speakers = probe_speakers(&json!({"speakers": ["a", "b"]}));
        assert_eq!(speakers, vec!["a", "b"]);

        let nested = probe_speakers(&json!({"data": {"speakers": ["x"]}}));
        assert_eq!(nested, vec!["x"]);

        let voices = probe_speakers(&json!({"voices": ["v1"], "speakers": []}));
        assert_eq!(voices, vec!["v1"]);
    }

    #[test]
    fn probe_failure_yields_empty_not_error() {
        assert!(probe_speakers(&json!({"unrelated": 1})).is_empty());
        assert!(probe_speakers(&json!({"speakers": "not-a-list"})).is_empty());
        assert!(probe_speakers(&json!(null)).is_empty());
    }

    #[test]
    fn audio_reply_accepts_base64_or_raw_samples() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"RIFFfake");
        let wav = decode_audio_reply(&json!({ "audio": encoded })).unwrap();
        assert_eq!(wav, b"RIFFfake");

        let samples: Vec<f32> = (0..64).map(|i| (i as f32 / 64.0).sin()).collect();
        let wav = decode_audio_reply(&json!({
            "samples": samples,
            "sample_rate": 22050,
        }))
        .unwrap();
        assert_eq!(&wav[..4], b"RIFF");

        assert!(decode_audio_reply(&json!({ "other": 1 })).is_err());
    }

    #[test]
    fn model_lists_are_merged_and_deduplicated() {
        let merged = merge_model_lists(vec![
            "tts_models/en/vctk/vits".to_string(),
            "custom/model".to_string(),
        ]);
        assert!(merged.contains(&"custom/model".to_string()));
        assert!(merged.contains(&"tts_models/en/jenny/jenny".to_string()));
        assert_eq!(
            merged
                .iter()
                .filter(|m| m.as_str() == "tts_models/en/vctk/vits")
                .count(),
            1
        );
    }
}
