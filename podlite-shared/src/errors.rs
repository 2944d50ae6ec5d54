//! Error types used across the podlite runtime.

use thiserror::Error;

/// Result type for podlite operations.
pub type PodliteResult<T> = Result<T, PodliteError>;

#[derive(Debug, Error)]
pub enum PodliteError {
    #[error("pod spec error: {0}")]
    Spec(String),

    #[error("vm setup error: {0}")]
    Setup(String),

    #[error("qemu error: {0}")]
    Qemu(String),

    #[error("qmp error: {0}")]
    Qmp(String),

    #[error("guest channel error: {0}")]
    Channel(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// Implement From for common error types to enable `?` operator
impl From<std::io::Error> for PodliteError {
    fn from(err: std::io::Error) -> Self {
        PodliteError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for PodliteError {
    fn from(err: serde_json::Error) -> Self {
        PodliteError::Internal(format!("JSON error: {}", err))
    }
}

impl From<String> for PodliteError {
    fn from(err: String) -> Self {
        PodliteError::Internal(err)
    }
}

impl From<&str> for PodliteError {
    fn from(err: &str) -> Self {
        PodliteError::Internal(err.to_string())
    }
}
