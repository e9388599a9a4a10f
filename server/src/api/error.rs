//! Error responses of the HTTP surface.
//!
//! [`ServiceError`]s map onto status codes with a JSON `{code, message}` body.
//! Internal causes are logged and never sent to the client.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use user_service_core::ServiceError;

/// Error body sent to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Application error type for HTTP handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// A 400 response for malformed input.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_ARGUMENT",
            message: message.into(),
        }
    }

    /// Status code of the response.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code of the response.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let code = error.code();
        let (status, message) = match error {
            ServiceError::NotFound => (StatusCode::NOT_FOUND, "user not found".to_string()),
            ServiceError::AlreadyExists => (StatusCode::CONFLICT, "user already exists".to_string()),
            ServiceError::PermissionDenied(reason) => (StatusCode::FORBIDDEN, reason),
            ServiceError::InvalidArgument(reason) => (StatusCode::BAD_REQUEST, reason),
            ServiceError::Internal(cause) => {
                tracing::error!(error = %cause, "Internal error while serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        Self {
            status,
            code,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
