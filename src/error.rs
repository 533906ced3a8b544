use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors that stop a request before it reaches a backend, or that break the
/// service itself. Generation failures travel inside `GenerationResult` instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model is still loading")]
    ModelLoading,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("deployment at capacity: {0}")]
    Capacity(String),
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::ModelLoading => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::ModelLoad(_) | ServiceError::Io(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failures raised by a backend adapter or the engine behind it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Execution(String),
    #[error("generation was cancelled")]
    Cancelled,
    #[error("generation engine is shut down")]
    EngineShutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Backend,
    Timeout,
}

/// Why a generation produced no text. Kept distinct so callers can tell a
/// deadline miss (retryable) from a model fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("generation exceeded its deadline of {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl GenerationFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            GenerationFailure::Backend(_) => FailureKind::Backend,
            GenerationFailure::Timeout(_) => FailureKind::Timeout,
        }
    }
}

impl FailureKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            FailureKind::Backend => StatusCode::INTERNAL_SERVER_ERROR,
            FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}
