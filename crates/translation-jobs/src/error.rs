//! Error types for the translation job pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No job stored under the key
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A job already exists under the key and replacement was not requested
    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    /// Job exists but has no chunk with this index
    #[error("Chunk {index} not found in job {job_key}")]
    ChunkNotFound { job_key: String, index: u32 },

    /// Caller supplied something unusable
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Store contention on job {job_key} after {attempts} attempts")]
    Contention { job_key: String, attempts: u32 },

    /// Durable store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a chunk-not-found error
    pub fn chunk_not_found(job_key: impl Into<String>, index: u32) -> Self {
        Self::ChunkNotFound {
            job_key: job_key.into(),
            index,
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::BAD_REQUEST, "config_error", msg.clone()),
            Error::JobNotFound(key) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Job not found: {}", key),
            ),
            Error::JobAlreadyExists(key) => (
                StatusCode::CONFLICT,
                "already_exists",
                format!("Job already exists: {}", key),
            ),
            Error::ChunkNotFound { .. } => {
                (StatusCode::NOT_FOUND, "chunk_not_found", self.to_string())
            }
            Error::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg.clone()),
            Error::Contention { .. } => (StatusCode::CONFLICT, "contention", self.to_string()),
            Error::Storage(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg.clone())
            }
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Http(err) => (StatusCode::BAD_GATEWAY, "http_error", err.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
