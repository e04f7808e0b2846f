//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
///
/// Variants map one-to-one onto the error codes the routing layer turns
/// into HTTP statuses; see [`Error::code`] and [`Error::http_status`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("package not found: {0}")]
    NotFound(String),

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid package name: {0}")]
    InvalidName(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error code for programmatic handling by the routing layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::VersionNotFound(_) => "VERSION_NOT_EXIST",
            Self::Conflict(_) => "CONFLICT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::InvalidName(_) | Self::Validation(_) => "BAD_DATA",
            Self::Serialization(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the routing layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::VersionNotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::ServiceUnavailable(_) => 503,
            Self::InvalidName(_) | Self::Validation(_) => 400,
            Self::Serialization(_) | Self::Internal(_) => 500,
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
