//! HTTP error mapping: core error kinds to status codes and
//! `{"detail": …}` bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;
use waldiez_runner_core::RunnerError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not authenticated")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Admin access required")
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

impl From<RunnerError> for ApiError {
    fn from(error: RunnerError) -> Self {
        let status = match &error {
            RunnerError::InvalidInput(_)
            | RunnerError::TooManyActive { .. }
            | RunnerError::DuplicateFlow { .. }
            | RunnerError::InvalidState(_) => StatusCode::BAD_REQUEST,
            RunnerError::NotFound(_) => StatusCode::NOT_FOUND,
            RunnerError::WorkflowValidation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RunnerError::Auth => StatusCode::UNAUTHORIZED,
            RunnerError::Storage(_)
            | RunnerError::Broker(_)
            | RunnerError::Database(_)
            | RunnerError::Redis(_)
            | RunnerError::Io(_)
            | RunnerError::Serialization(_)
            | RunnerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {error}");
            // Internals never leak to clients.
            return Self::new(status, "An unexpected error occurred.");
        }
        Self::new(status, error.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
