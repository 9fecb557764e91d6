//! Error types for the compression server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pdfshrink_core::CompressError;
use serde::Serialize;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    InvalidTier(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    CorruptInput(String),

    /// Free-tier limit exceeded
    #[error("{0}")]
    Restricted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    upgrade_required: bool,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ServerError::InvalidTier(_) => (StatusCode::BAD_REQUEST, "INVALID_COMPRESSION_LEVEL"),
            ServerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ServerError::CorruptInput(_) => (StatusCode::UNPROCESSABLE_ENTITY, "CORRUPT_INPUT"),
            ServerError::Restricted(_) => (StatusCode::FORBIDDEN, "UPGRADE_REQUIRED"),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            code: code.to_string(),
            upgrade_required: matches!(self, ServerError::Restricted(_)),
        };

        (status, Json(body)).into_response()
    }
}

impl From<CompressError> for ServerError {
    fn from(err: CompressError) -> Self {
        match err {
            CompressError::InvalidTier(_) => ServerError::InvalidTier(err.to_string()),
            CompressError::CorruptInput(_) => ServerError::CorruptInput(err.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}
