//! Error handling for the HTTP server
//!
//! Maps application and engine errors to HTTP responses with one JSON
//! error shape:
//!
//! ```json
//! {
//!   "error": {
//!     "code": "KEY_NOT_FOUND",
//!     "message": "Not found: key 'user-42'"
//!   }
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    /// No table had the requested key (404)
    NotFound(String),

    /// Invalid request (400)
    BadRequest(String),

    /// Internal server error (500)
    Internal(String),

    /// Error from the engine or core library
    Core(shardline_core::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::Core(err) => write!(f, "Core error: {}", err),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "KEY_NOT_FOUND"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Core(err) => match err {
                shardline_core::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                shardline_core::Error::InvalidInput(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_INPUT")
                }
                shardline_core::Error::RemoteUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        // Misses are routine; only log what is actually wrong
        if status.is_server_error() {
            tracing::error!("Request error: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: error_code.to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(error_response)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g. "KEY_NOT_FOUND")
    code: String,

    message: String,
}

impl From<shardline_core::Error> for AppError {
    fn from(err: shardline_core::Error) -> Self {
        AppError::Core(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::NotFound("key 'u1'".to_string());
        assert_eq!(err.to_string(), "Not found: key 'u1'");
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        let core: AppError = shardline_core::Error::remote("etcd down").into();
        assert!(matches!(core, AppError::Core(_)));
        assert_eq!(core.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        let codec: AppError = shardline_core::Error::codec("short buffer").into();
        assert_eq!(
            codec.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
