#![forbid(unsafe_code)]

//! Error taxonomy shared by every pipeline stage.
//!
//! Resolution and extraction errors only ever abort the input reference they
//! belong to. Fetch errors feed the retry policy before they become terminal,
//! process errors are always terminal for their job, and update errors never
//! leave the self-update boundary.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, Error, Clone)]
pub enum ExtractionError {
    #[error("page unavailable: {0}")]
    Unavailable(#[source] FetchError),

    #[error("{url} is not available for free streaming")]
    NotStreamable { url: String },

    #[error("could not parse page data from {url}: {reason}")]
    Parse { url: String, reason: String },
}

/// Why one input URL produced no jobs.
#[derive(Debug, Error, Clone)]
pub enum InputError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server answered {status} for {url}")]
    Status { status: u16, url: String },

    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("local write failed: {0}")]
    Io(String),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures are retried: timeouts, dropped connections, 5xx and
    /// (unless disabled) 429. Other 4xx answers and local IO are permanent.
    pub fn is_retryable(&self, retry_on_429: bool) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) => true,
            FetchError::Status { status, .. } => {
                *status >= 500 || (*status == 429 && retry_on_429)
            }
            FetchError::InvalidRequest(_) | FetchError::Io(_) | FetchError::Cancelled => false,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => FetchError::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe => FetchError::Connection(err.to_string()),
            _ => FetchError::Io(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("codec is missing: {tool}")]
    CodecMissing { tool: String },

    #[error("codec failed (code={code:?}): {stderr}")]
    CodecFailed { code: Option<i32>, stderr: String },

    #[error("codec timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("tagging failed for {path}: {reason}")]
    Tagging { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update check failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("invalid version manifest: {0}")]
    Manifest(String),

    #[error("downloaded pipeline is empty")]
    EmptyPayload,

    #[error("size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("signature rejected: {0}")]
    Signature(String),

    #[error("pipeline candidate is not loadable: {0}")]
    NotLoadable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job ended `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    Fetch,
    Process,
    Io,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "batch cancelled".to_string(),
        }
    }

    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<FetchError> for JobFailure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => JobFailure::cancelled(),
            FetchError::Io(message) => JobFailure::new(FailureKind::Io, message),
            other => JobFailure::new(FailureKind::Fetch, other.to_string()),
        }
    }
}

impl From<ProcessError> for JobFailure {
    fn from(err: ProcessError) -> Self {
        JobFailure::new(FailureKind::Process, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> FetchError {
        FetchError::Status {
            status: code,
            url: "https://example.com".into(),
        }
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(status(500).is_retryable(true));
        assert!(status(503).is_retryable(false));
        assert!(status(429).is_retryable(true));
        assert!(!status(429).is_retryable(false));
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!status(404).is_retryable(true));
        assert!(!status(403).is_retryable(true));
        assert!(!FetchError::Io("disk full".into()).is_retryable(true));
    }

    #[test]
    fn io_errors_map_to_transient_kinds() {
        let err: FetchError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, FetchError::Connection(_)));
        let err: FetchError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_retryable(false));
    }

    #[test]
    fn cancelled_fetch_becomes_cancelled_failure() {
        let failure: JobFailure = FetchError::Cancelled.into();
        assert_eq!(failure.kind, FailureKind::Cancelled);
    }
}
