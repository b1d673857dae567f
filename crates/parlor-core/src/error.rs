//! Error types shared across the core crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad input from the client (missing prompt, malformed chat id).
    #[error("{0}")]
    Validation(String),

    /// Missing API key or endpoint for the selected backend.
    #[error("{0}")]
    Configuration(String),

    /// A non-2xx reply from an external backend.
    #[error("upstream error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    /// Connectivity failure (timeout, refused connection) after retries.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    NotFound(String),

    /// The task was cancelled by the client. Expected, not exceptional.
    #[error("cancelled")]
    Cancelled,

    #[error("audio error: {0}")]
    Audio(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn upstream(status: Option<u16>, msg: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: msg.into(),
        }
    }

    /// True for errors worth retrying: transport failures and 5xx replies.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Upstream { status, .. } => status.map(|s| s >= 500).unwrap_or(true),
            _ => false,
        }
    }
}
