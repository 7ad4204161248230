use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Conditions that abort the whole batch run.
///
/// None of these are attributable to a single job; per-job failures are
/// carried by [`ExecutionError`] and end up in the checkpoint instead.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read checkpoint file {path}: {source}")]
    CheckpointRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint file {path} is corrupt at line {line}: {source}")]
    CheckpointCorrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cannot append to checkpoint file {path}: {source}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Input error: {0}")]
    Input(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classification tag carried by every executor failure.
///
/// Retry decisions are made from this tag alone, see
/// [`RetryClassifier`](crate::retry::RetryClassifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS, 5xx from the service.
    Transport,
    /// The per-call timeout elapsed.
    Timeout,
    /// The service rejected the call because of quota or rate.
    RateLimited,
    /// Missing, invalid or unauthorized credentials.
    Authentication,
    /// The service refused the request as malformed or invalid.
    InvalidRequest,
    /// Anything the executor could not place in another bucket.
    Other,
}

impl ErrorKind {
    /// Infers a kind from free-form error text.
    ///
    /// Used by executors that only get a message back from the service.
    pub fn from_message(message: &str) -> Self {
        let text = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| text.contains(w));

        if has(&["quota", "rate limit", "too many requests"]) {
            ErrorKind::RateLimited
        } else if has(&["timeout", "timed out"]) {
            ErrorKind::Timeout
        } else if has(&["network", "connection"]) {
            ErrorKind::Transport
        } else if has(&["unauthorized", "forbidden", "api key", "authentication"]) {
            ErrorKind::Authentication
        } else if has(&["invalid", "malformed"]) {
            ErrorKind::InvalidRequest
        } else {
            ErrorKind::Other
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Authentication => "authentication",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed generation call, as returned by an [`Executor`](crate::executor::Executor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-provided hint for how long to wait before the next call.
    pub retry_after: Option<Duration>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Builds an error whose kind is inferred from `message`.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::from_message(&message), message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: "rate limited by service".to_string(),
            retry_after,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }
}
