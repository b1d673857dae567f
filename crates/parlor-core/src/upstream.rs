//! Retrying HTTP client used for every external generation backend.
//!
//! All upstream traffic goes through [`UpstreamClient::request`] (buffered)
//! or [`UpstreamClient::request_stream`] (the live connection is handed to
//! the caller, who is responsible for dropping it). Timeouts and 5xx
//! replies are retried with exponential backoff; 4xx replies are terminal
//! and surface immediately.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_RETRIES: usize = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// A buffered upstream reply, normalised for callers.
#[derive(Debug, Clone)]
pub enum UpstreamBody {
    /// 204 or an empty body.
    Empty,
    Json(Value),
    /// 2xx body that did not parse as JSON.
    Text(String),
}

impl UpstreamBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            UpstreamBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// One buffered request with the default retry policy.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, String)],
        timeout: Duration,
    ) -> Result<UpstreamBody> {
        self.request_with_retries(method, url, body, headers, timeout, DEFAULT_RETRIES)
            .await
    }

    pub async fn request_with_retries(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, String)],
        timeout: Duration,
        retries: usize,
    ) -> Result<UpstreamBody> {
        let header_map = build_headers(headers, false)?;
        debug!(%method, url, ?timeout, retries, "upstream request");
        retry_async(retries, DEFAULT_BACKOFF, |attempt| {
            let request = self
                .http
                .request(method.clone(), url)
                .headers(header_map.clone())
                .timeout(timeout);
            let request = match body {
                Some(json) => request.json(json),
                None => request,
            };
            async move {
                if attempt > 0 {
                    debug!(url, attempt, "retrying upstream request");
                }
                let response = request.send().await.map_err(map_transport_error)?;
                read_buffered(response).await
            }
        })
        .await
    }

    /// Opens a streaming connection and hands it to the caller once the
    /// status line has been checked. The caller must drop the response to
    /// close the connection.
    pub async fn request_stream(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, String)],
        timeout: Duration,
        retries: usize,
    ) -> Result<reqwest::Response> {
        let header_map = build_headers(headers, true)?;
        debug!(%method, url, ?timeout, "upstream stream request");
        retry_async(retries, DEFAULT_BACKOFF, |_attempt| {
            let request = self
                .http
                .request(method.clone(), url)
                .headers(header_map.clone())
                .timeout(timeout);
            let request = match body {
                Some(json) => request.json(json),
                None => request,
            };
            async move {
                let response = request.send().await.map_err(map_transport_error)?;
                check_status(response).await
            }
        })
        .await
    }
}

/// Runs `op` up to `retries` times, backing off `backoff * 2^attempt`
/// between attempts. Non-retryable errors (4xx) abort immediately;
/// exhausting retries re-raises the last error seen.
pub async fn retry_async<T, F, Fut>(retries: usize, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = retries.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(attempt = attempt + 1, attempts, error = %err, "upstream attempt failed");
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(backoff * 2u32.pow(attempt as u32)).await;
        }
    }
    Err(last_error
        .unwrap_or_else(|| Error::Transport("request failed without a recorded error".to_string())))
}

async fn read_buffered(response: reqwest::Response) -> Result<UpstreamBody> {
    let response = check_status(response).await?;
    if response.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(UpstreamBody::Empty);
    }
    let text = response.text().await.map_err(map_transport_error)?;
    if text.is_empty() {
        return Ok(UpstreamBody::Empty);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(UpstreamBody::Json(value)),
        Err(_) => {
            warn!("upstream reply was not valid JSON, returning raw text");
            Ok(UpstreamBody::Text(text))
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(Error::upstream(Some(code), extract_error_message(&body)))
}

/// Pulls a human-readable message out of a JSON error body, falling back
/// to the raw (truncated) text.
fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidate = value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .or_else(|| value.get("error"))
            .and_then(Value::as_str);
        if let Some(message) = candidate {
            return message.to_string();
        }
    }
    let mut text = body.trim().to_string();
    if text.is_empty() {
        text = "upstream returned an error with no body".to_string();
    }
    text.chars().take(500).collect()
}

fn map_transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Transport(format!("request timed out: {err}"))
    } else {
        Error::Transport(err.to_string())
    }
}

fn build_headers(headers: &[(&str, String)], streaming: bool) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    map.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    map.insert(
        ACCEPT,
        HeaderValue::from_static(if streaming {
            "text/event-stream"
        } else {
            "application/json"
        }),
    );
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Internal(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Internal(format!("invalid header value: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_transport_errors_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result = retry_async(3, Duration::ZERO, move |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Transport("timed out".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<()> = retry_async(3, Duration::ZERO, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::upstream(Some(404), "not found"))
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::Upstream {
                status: Some(404),
                ..
            })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let result: Result<()> = retry_async(2, Duration::ZERO, |attempt| async move {
            Err(Error::Transport(format!("attempt {attempt} failed")))
        })
        .await;
        match result {
            Err(Error::Transport(message)) => assert_eq!(message, "attempt 1 failed"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn error_message_extraction_prefers_nested_json() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"bad key"}}"#),
            "bad key"
        );
        assert_eq!(extract_error_message(r#"{"message":"plain"}"#), "plain");
        assert_eq!(extract_error_message("raw body"), "raw body");
    }

    #[test]
    fn five_hundreds_are_retryable_and_four_hundreds_are_not() {
        assert!(Error::upstream(Some(500), "boom").is_retryable());
        assert!(Error::upstream(Some(503), "boom").is_retryable());
        assert!(!Error::upstream(Some(400), "bad").is_retryable());
        assert!(Error::Transport("refused".to_string()).is_retryable());
    }
}
