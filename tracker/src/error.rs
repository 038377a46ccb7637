//! Error types for the tracker emitters

use thiserror::Error;

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Crate-level error type
///
/// Only construction and filesystem plumbing fail with this type. Delivery
/// failures never do; they are reported through [`crate::SendOutcome`].
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Invalid configuration, detected at construction time
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client could not be built
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Serialization(err.to_string())
    }
}

/// Error for a single delivery request
///
/// The `Display` text is what callers see in a failed [`crate::SendOutcome`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// Collector could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// Collector answered with a non-2xx status
    #[error("collector returned {code}")]
    Status { code: u16 },

    /// Connect or read exceeded the configured timeout
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Socket read/write failure
    #[error("socket I/O failed: {0}")]
    Io(String),

    /// Response could not be understood
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl EmitError {
    /// Status code stored in a debug request result for this failure
    ///
    /// Failures without an HTTP response are recorded as `0`.
    pub fn code(&self) -> u16 {
        match self {
            EmitError::Status { code } => *code,
            _ => 0,
        }
    }
}

impl From<reqwest::Error> for EmitError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            EmitError::Status {
                code: status.as_u16(),
            }
        } else if err.is_timeout() {
            EmitError::Connection(format!("request timed out: {err}"))
        } else {
            EmitError::Connection(err.to_string())
        }
    }
}
