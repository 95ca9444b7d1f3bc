use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure to read container metadata from a source file.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start probe engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe engine exited with {status}: {diagnostic}")]
    Failed { status: String, diagnostic: String },

    #[error("unreadable probe output: {0}")]
    Malformed(String),
}

/// Failure of the external encode engine. Terminal for the job attempt.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to start encode engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encode engine exited with {status}: {diagnostic}")]
    Failed { status: String, diagnostic: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt status document: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Target size must be smaller than the original file size")]
    TargetTooLarge { original_size_mb: f64 },

    #[error("File too large")]
    PayloadTooLarge,

    #[error("Unauthorized: Invalid API Key")]
    Unauthorized,

    #[error("{0}")]
    NotFound(&'static str),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn to_err_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::TargetTooLarge { .. } => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Probe(_) | ApiError::Encode(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        ApiError::Internal(error.into())
    }
}

/// The body limit surfaces as a multipart error, keep its 413.
impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::PayloadTooLarge;
        }
        ApiError::validation(format!("Invalid multipart body: {}", error.body_text()))
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Internal(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.to_err_code();
        let body = match &self {
            ApiError::TargetTooLarge { original_size_mb } => json!({
                "error": self.to_string(),
                "status": status.as_u16(),
                "originalSize": original_size_mb,
            }),
            // engine diagnostics stay in the log
            ApiError::Probe(_) | ApiError::Encode(_) | ApiError::Internal(_) => json!({
                "error": "Failed to process video",
                "status": status.as_u16(),
            }),
            _ => json!({
                "error": self.to_string(),
                "status": status.as_u16(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
