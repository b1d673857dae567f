//! Image generation coordinator for the ComfyUI render queue.
//!
//! Submits a parameterized workflow graph, then polls the history endpoint
//! until output appears, the job fails, the wall clock runs out, or the
//! client cancels. Cancellation sends an out-of-band `/interrupt` to the
//! engine before the poller stops.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::{TaskKind, TaskRegistry};
use crate::upstream::{UpstreamBody, UpstreamClient};

// Well-known node ids in the default workflow graph.
const POSITIVE_PROMPT_NODE: &str = "6";
const CHECKPOINT_NODE: &str = "4";
const SAMPLER_NODE: &str = "3";
const LATENT_IMAGE_NODE: &str = "5";
const OUTPUT_NODE: &str = "9";

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_secs(15);
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_secs(3);
const GENERATION_DEADLINE: Duration = Duration::from_secs(300);

/// Sampler and canvas settings applied onto the workflow graph.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub checkpoint: Option<String>,
    pub seed: u64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler: String,
    pub scheduler: String,
    pub denoise: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            checkpoint: None,
            seed: 0,
            steps: 25,
            cfg: 7.0,
            sampler: "euler".to_string(),
            scheduler: "normal".to_string(),
            denoise: 1.0,
            width: 512,
            height: 512,
        }
    }
}

/// How a generation run ended, beyond hard errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Completed { image_url: String },
    Cancelled,
}

/// The built-in text-to-image workflow, used when the caller does not
/// supply a graph of their own.
pub fn default_workflow() -> Value {
    json!({
        SAMPLER_NODE: {
            "inputs": {
                "seed": 1, "steps": 25, "cfg": 7, "sampler_name": "euler",
                "scheduler": "normal", "denoise": 1,
                "model": [CHECKPOINT_NODE, 0],
                "positive": [POSITIVE_PROMPT_NODE, 0],
                "negative": ["7", 0],
                "latent_image": [LATENT_IMAGE_NODE, 0],
            },
            "class_type": "KSampler",
        },
        CHECKPOINT_NODE: {
            "inputs": {"ckpt_name": "sd_xl_base_1.0.safetensors"},
            "class_type": "CheckpointLoaderSimple",
        },
        LATENT_IMAGE_NODE: {
            "inputs": {"width": 512, "height": 512, "batch_size": 1},
            "class_type": "EmptyLatentImage",
        },
        POSITIVE_PROMPT_NODE: {
            "inputs": {"text": "", "clip": [CHECKPOINT_NODE, 1]},
            "class_type": "CLIPTextEncode",
        },
        "7": {
            "inputs": {
                "text": crate::config::DEFAULT_NEGATIVE_PROMPT,
                "clip": [CHECKPOINT_NODE, 1],
            },
            "class_type": "CLIPTextEncode",
        },
        "8": {
            "inputs": {"samples": [SAMPLER_NODE, 0], "vae": [CHECKPOINT_NODE, 2]},
            "class_type": "VAEDecode",
        },
        OUTPUT_NODE: {
            "inputs": {"filename_prefix": "parlor_output", "images": ["8", 0]},
            "class_type": "SaveImage",
        },
    })
}

/// Writes the prompt and settings onto the graph's well-known nodes. A seed
/// of zero is replaced with a time-derived pseudo-random value so repeated
/// requests do not render identical images.
pub fn apply_settings(workflow: &mut Value, prompt: &str, settings: &ImageSettings) {
    if let Some(inputs) = node_inputs(workflow, POSITIVE_PROMPT_NODE) {
        inputs.insert("text".to_string(), json!(prompt));
    }
    if let Some(checkpoint) = settings.checkpoint.as_deref().filter(|c| !c.is_empty()) {
        if let Some(inputs) = node_inputs(workflow, CHECKPOINT_NODE) {
            inputs.insert("ckpt_name".to_string(), json!(checkpoint));
        }
    }
    if let Some(inputs) = node_inputs(workflow, SAMPLER_NODE) {
        let seed = if settings.seed == 0 {
            random_seed()
        } else {
            settings.seed
        };
        inputs.insert("seed".to_string(), json!(seed));
        inputs.insert("steps".to_string(), json!(settings.steps));
        inputs.insert("cfg".to_string(), json!(settings.cfg));
        inputs.insert("sampler_name".to_string(), json!(settings.sampler));
        inputs.insert("scheduler".to_string(), json!(settings.scheduler));
        inputs.insert("denoise".to_string(), json!(settings.denoise));
    }
    if let Some(inputs) = node_inputs(workflow, LATENT_IMAGE_NODE) {
        inputs.insert("width".to_string(), json!(settings.width));
        inputs.insert("height".to_string(), json!(settings.height));
    }
}

fn node_inputs<'a>(
    workflow: &'a mut Value,
    node_id: &str,
) -> Option<&'a mut serde_json::Map<String, Value>> {
    workflow
        .get_mut(node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
}

fn random_seed() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let jitter: u64 = rand::thread_rng().gen_range(1..u32::MAX as u64);
    ((millis ^ jitter) % u64::from(u32::MAX)).max(1)
}

/// Collects node-level error details from a ComfyUI history record.
pub fn find_node_errors(prompt_history: &Value) -> Option<String> {
    let mut errors = Vec::new();

    if let Some(exception) = prompt_history.pointer("/status/exception") {
        if let Some(parts) = exception.as_array() {
            if parts.len() > 1 {
                errors.push(format!("Exception: {} (Type: {})", parts[1], parts[0]));
            } else {
                errors.push(format!("Exception: {exception}"));
            }
        } else if !exception.is_null() {
            errors.push(format!("Exception: {exception}"));
        }
    }
    if let Some(error) = prompt_history.get("error") {
        errors.push(format!("General Error: {error}"));
    }
    if let Some(node_errors) = prompt_history.get("node_errors").and_then(Value::as_object) {
        for (node_id, info) in node_errors {
            let message = info
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| info.to_string());
            errors.push(format!("Node {node_id}: {message}"));
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

#[derive(Debug, Clone)]
pub struct ImageCoordinator {
    upstream: UpstreamClient,
}

impl ImageCoordinator {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    /// Probes the engine's root URL.
    pub async fn status(&self, base_url: &str) -> Result<()> {
        self.upstream
            .request(Method::GET, &format!("{base_url}/"), None, &[], STATUS_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Fetches the checkpoint names the engine's loader node knows about.
    pub async fn checkpoints(&self, base_url: &str) -> Result<Vec<String>> {
        const NODE_CLASS: &str = "CheckpointLoaderSimple";
        let url = format!("{base_url}/object_info/{NODE_CLASS}");
        let body = self
            .upstream
            .request(Method::GET, &url, None, &[], POLL_TIMEOUT)
            .await?;
        let names = body
            .as_json()
            .and_then(|v| v.pointer(&format!("/{NODE_CLASS}/input/required/ckpt_name/0")))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::upstream(None, "Could not locate checkpoint list structure")
            })?;
        Ok(names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    /// Submits the workflow, then polls history until the run resolves.
    /// The registry entry for `client_id` is removed on every exit path.
    pub async fn generate(
        &self,
        registry: &TaskRegistry,
        client_id: &str,
        base_url: &str,
        workflow: Value,
    ) -> Result<ImageOutcome> {
        let result = self
            .generate_inner(registry, client_id, base_url, workflow)
            .await;
        registry.complete(client_id);
        result
    }

    async fn generate_inner(
        &self,
        registry: &TaskRegistry,
        client_id: &str,
        base_url: &str,
        workflow: Value,
    ) -> Result<ImageOutcome> {
        let payload = json!({ "prompt": workflow, "client_id": client_id });
        let body = self
            .upstream
            .request(
                Method::POST,
                &format!("{base_url}/prompt"),
                Some(&payload),
                &[],
                SUBMIT_TIMEOUT,
            )
            .await?;
        let prompt_id = body
            .as_json()
            .and_then(|v| v.get("prompt_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::upstream(None, "Failed to queue prompt with ComfyUI"))?
            .to_string();

        registry.register(client_id, TaskKind::Image);
        registry.attach_prompt_id(client_id, &prompt_id);
        info!(client_id, prompt_id, "image workflow queued");

        let started = Instant::now();
        while started.elapsed() < GENERATION_DEADLINE {
            if !registry.is_active(client_id) {
                info!(client_id, prompt_id, "image generation cancelled");
                self.interrupt(base_url, client_id).await;
                return Ok(ImageOutcome::Cancelled);
            }

            match self.poll_history(base_url, &prompt_id).await {
                Ok(Some(resolution)) => return resolution.map(|url| ImageOutcome::Completed {
                    image_url: url,
                }),
                Ok(None) => {}
                // Poll failures are transient; the deadline bounds them.
                Err(err) => warn!(prompt_id, error = %err, "history poll failed, will retry"),
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(Error::upstream(
            None,
            "Image generation timed out or failed",
        ))
    }

    /// One history poll. `Ok(None)` means the job has not resolved yet;
    /// `Ok(Some(result))` carries either the image URL or the job's error.
    async fn poll_history(&self, base_url: &str, prompt_id: &str) -> Result<Option<Result<String>>> {
        let url = format!("{base_url}/history/{prompt_id}");
        let body = self
            .upstream
            .request_with_retries(Method::GET, &url, None, &[], POLL_TIMEOUT, 2)
            .await?;
        let Some(record) = body.as_json().and_then(|v| v.get(prompt_id)) else {
            return Ok(None);
        };

        let outputs = record.get("outputs").cloned().unwrap_or(json!({}));
        if let Some(image) = outputs
            .pointer(&format!("/{OUTPUT_NODE}/images/0"))
            .filter(|image| image.get("filename").is_some())
        {
            return Ok(Some(Ok(view_url(base_url, image))));
        }

        let status = record
            .pointer("/status/status_str")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let completed = record
            .pointer("/status/completed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        debug!(prompt_id, status, completed, "image poll");

        if status == "error" || status == "failed" {
            let mut message = format!("Image generation failed: {status}");
            if let Some(details) = find_node_errors(record) {
                message.push_str(&format!(" Details: {details}"));
            }
            return Ok(Some(Err(Error::upstream(None, message))));
        }
        if completed {
            return Ok(Some(Err(Error::upstream(
                None,
                format!("Image generation finished, but output node '{OUTPUT_NODE}' produced nothing"),
            ))));
        }
        Ok(None)
    }

    /// Best-effort out-of-band interrupt; failures are logged, not raised.
    pub async fn interrupt(&self, base_url: &str, client_id: &str) {
        let payload = json!({ "client_id": client_id });
        if let Err(err) = self
            .upstream
            .request_with_retries(
                Method::POST,
                &format!("{base_url}/interrupt"),
                Some(&payload),
                &[],
                INTERRUPT_TIMEOUT,
                1,
            )
            .await
        {
            warn!(client_id, error = %err, "could not send interrupt");
        }
    }
}

/// Builds the retrievable URL for a finished image record.
fn view_url(base_url: &str, image: &Value) -> String {
    let filename = image.get("filename").and_then(Value::as_str).unwrap_or("");
    let subfolder = image.get("subfolder").and_then(Value::as_str).unwrap_or("");
    let kind = image
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("output");
    format!(
        "{base_url}/view?filename={}&subfolder={}&type={}",
        urlencode(filename),
        urlencode(subfolder),
        urlencode(kind)
    )
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_are_written_to_the_sampler_node() {
        let mut workflow = default_workflow();
        let settings = ImageSettings {
            seed: 0,
            steps: 10,
            ..Default::default()
        };
        apply_settings(&mut workflow, "a red fox", &settings);

        let sampler = &workflow[SAMPLER_NODE]["inputs"];
        assert_eq!(sampler["steps"], json!(10));
        assert!(sampler["seed"].as_u64().unwrap() > 0, "zero seed replaced");
        assert_eq!(
            workflow[POSITIVE_PROMPT_NODE]["inputs"]["text"],
            json!("a red fox")
        );
    }

    #[test]
    fn explicit_seed_and_canvas_are_preserved() {
        let mut workflow = default_workflow();
        let settings = ImageSettings {
            seed: 42,
            width: 768,
            height: 1024,
            checkpoint: Some("custom.safetensors".to_string()),
            ..Default::default()
        };
        apply_settings(&mut workflow, "p", &settings);
        assert_eq!(workflow[SAMPLER_NODE]["inputs"]["seed"], json!(42));
        assert_eq!(workflow[LATENT_IMAGE_NODE]["inputs"]["width"], json!(768));
        assert_eq!(workflow[LATENT_IMAGE_NODE]["inputs"]["height"], json!(1024));
        assert_eq!(
            workflow[CHECKPOINT_NODE]["inputs"]["ckpt_name"],
            json!("custom.safetensors")
        );
    }

    #[test]
    fn missing_nodes_are_skipped_without_panicking() {
        let mut workflow = json!({"99": {"inputs": {}, "class_type": "Other"}});
        apply_settings(&mut workflow, "p", &ImageSettings::default());
        assert_eq!(workflow, json!({"99": {"inputs": {}, "class_type": "Other"}}));
    }

    #[test]
    fn node_errors_are_collected_and_joined() {
        let record = json!({
            "status": {"exception": ["RuntimeError", "out of VRAM"]},
            "node_errors": {"3": {"message": "bad sampler"}},
        });
        let details = find_node_errors(&record).unwrap();
        assert!(details.contains("out of VRAM"));
        assert!(details.contains("Node 3: bad sampler"));
        assert!(find_node_errors(&json!({"status": {}})).is_none());
    }

    #[test]
    fn view_url_escapes_query_values() {
        let image = json!({
            "filename": "img 01.png",
            "subfolder": "a/b",
            "type": "output",
        });
        let url = view_url("http://127.0.0.1:8188", &image);
        assert_eq!(
            url,
            "http://127.0.0.1:8188/view?filename=img+01.png&subfolder=a%2Fb&type=output"
        );
    }

    #[test]
    fn settings_deserialize_with_partial_json() {
        let settings: ImageSettings =
            serde_json::from_value(json!({"steps": 30, "seed": 7})).unwrap();
        assert_eq!(settings.steps, 30);
        assert_eq!(settings.seed, 7);
        assert_eq!(settings.sampler, "euler");
    }
}
