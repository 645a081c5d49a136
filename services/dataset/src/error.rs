//! Error kinds surfaced by dataset operations.
//!
//! Every failure reaches the caller as a kind plus a message. The HTTP layer
//! renders them as `{ "error": ..., "code": ... }` with the status returned by
//! [`DatasetError::status_code`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Errors that can occur while storing, merging or serving datasets
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Storage read failed: {0}")]
    StorageRead(String),

    #[error("File not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Join column '{column}' missing from {side} table (available: {available})")]
    JoinColumnMissing {
        column: String,
        side: &'static str,
        available: String,
    },

    #[error("Cannot join on '{column}': left key is {left}, right key is {right}")]
    IncompatibleJoin {
        column: String,
        left: String,
        right: String,
    },

    #[error("Merge result '{0}' expired or missing")]
    CacheMiss(String),

    #[error("Malformed file: {0}")]
    MalformedFile(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DatasetError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            DatasetError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            DatasetError::StorageWrite(_) => "STORAGE_WRITE_ERROR",
            DatasetError::StorageRead(_) => "STORAGE_READ_ERROR",
            DatasetError::RecordNotFound(_) => "RECORD_NOT_FOUND",
            DatasetError::JoinColumnMissing { .. } => "JOIN_COLUMN_MISSING",
            DatasetError::IncompatibleJoin { .. } => "INCOMPATIBLE_JOIN",
            DatasetError::CacheMiss(_) => "CACHE_MISS",
            DatasetError::MalformedFile(_) => "MALFORMED_FILE",
            DatasetError::InvalidRequest(_) => "INVALID_REQUEST",
            DatasetError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DatasetError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DatasetError::RecordNotFound(_) | DatasetError::CacheMiss(_) => StatusCode::NOT_FOUND,
            DatasetError::JoinColumnMissing { .. }
            | DatasetError::IncompatibleJoin { .. }
            | DatasetError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DatasetError::MalformedFile(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DatasetError::StorageWrite(_)
            | DatasetError::StorageRead(_)
            | DatasetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wrap an adapter error as a write failure, keeping its context chain
    pub(crate) fn write(err: anyhow::Error) -> Self {
        DatasetError::StorageWrite(format!("{err:#}"))
    }

    /// Wrap an adapter error as a read failure, keeping its context chain
    pub(crate) fn read(err: anyhow::Error) -> Self {
        DatasetError::StorageRead(format!("{err:#}"))
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for DatasetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (status, Json(body)).into_response()
    }
}
