//! API error types.

use anchor_core::nuclear::NuclearError;
use anchor_core::session::SessionError;
use anchor_storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Session state does not allow the operation.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Nuclear block rule violated.
    #[error("{0}")]
    Nuclear(#[from] NuclearError),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            ApiError::Storage(StorageError::InvalidUpdate(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_config")
            }
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            ApiError::Session(e) => match e {
                SessionError::AlreadyActive => (StatusCode::CONFLICT, "session_active"),
                SessionError::NotActive => (StatusCode::CONFLICT, "session_inactive"),
                SessionError::BreakActive => (StatusCode::CONFLICT, "break_active"),
                SessionError::NoBreak => (StatusCode::CONFLICT, "no_break"),
                SessionError::NoReward => (StatusCode::CONFLICT, "no_reward"),
                SessionError::EngineStopped => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "engine_stopped")
                }
            },
            ApiError::Nuclear(e) => match e {
                NuclearError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                NuclearError::ExceptionNotFound(_) => (StatusCode::NOT_FOUND, "exception_not_found"),
                NuclearError::NoDomains => (StatusCode::BAD_REQUEST, "no_domains"),
                NuclearError::InvalidException { .. } => {
                    (StatusCode::BAD_REQUEST, "invalid_exception")
                }
                NuclearError::NegativeCooldown => (StatusCode::BAD_REQUEST, "negative_cooldown"),
                NuclearError::CooldownTooLong { .. } => {
                    (StatusCode::BAD_REQUEST, "cooldown_too_long")
                }
                NuclearError::AlreadyCovered(_) => (StatusCode::CONFLICT, "already_covered"),
                NuclearError::NotReady { .. } => (StatusCode::CONFLICT, "not_ready"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::warn!(code, "Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_domain_errors_to_status() {
        let cases = [
            (ApiError::from(SessionError::AlreadyActive), StatusCode::CONFLICT),
            (ApiError::from(NuclearError::NoDomains), StatusCode::BAD_REQUEST),
            (ApiError::from(NuclearError::NotFound("x".into())), StatusCode::NOT_FOUND),
            (
                ApiError::from(StorageError::InvalidUpdate("bad".into())),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::from(StorageError::Config("disk".into())), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
