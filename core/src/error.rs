//! Caller-visible errors of the user service.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for user service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Typed failure of a user service operation.
///
/// Internal causes are carried for logging; transports expose only the
/// category and a generic message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The requested user does not exist.
    #[error("user not found")]
    NotFound,

    /// A user with the same natural key already exists.
    #[error("user already exists")]
    AlreadyExists,

    /// The caller may not act on the target user.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Store failure or other unexpected condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::AlreadyExists => Self::AlreadyExists,
            StoreError::Internal(cause) => Self::Internal(cause),
        }
    }
}
