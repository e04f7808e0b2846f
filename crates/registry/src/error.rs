//! Facade error type.

use pantry_storage::StorageError;
use pantry_uplink::UplinkError;
use thiserror::Error;

/// Errors surfaced by the registry facade.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Core(#[from] pantry_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("uplink error: {0}")]
    Uplink(#[from] UplinkError),
}

impl RegistryError {
    /// Shorthand constructors for the common domain outcomes.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::Core(pantry_core::Error::NotFound(what.into()))
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Core(pantry_core::Error::Conflict(what.into()))
    }

    pub fn service_unavailable(what: impl Into<String>) -> Self {
        Self::Core(pantry_core::Error::ServiceUnavailable(what.into()))
    }

    /// Stable error code for the routing layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.code(),
            Self::Storage(e) => match e {
                StorageError::NotFound(_) => "NOT_FOUND",
                StorageError::Conflict(_) => "CONFLICT",
                StorageError::InvalidName(_) => "BAD_DATA",
                StorageError::Domain(e) => e.code(),
                StorageError::LockContended(_)
                | StorageError::Cancelled
                | StorageError::Serialization(_)
                | StorageError::Io(_) => "INTERNAL_ERROR",
            },
            Self::Uplink(e) => {
                if e.remote_status() == Some(404) {
                    "NOT_FOUND"
                } else if e.is_timeout_class() {
                    "SERVICE_UNAVAILABLE"
                } else {
                    "INTERNAL_ERROR"
                }
            }
        }
    }

    /// HTTP status the routing layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self.code() {
            "NOT_FOUND" | "VERSION_NOT_EXIST" => 404,
            "CONFLICT" => 409,
            "SERVICE_UNAVAILABLE" => 503,
            "BAD_DATA" => 400,
            _ => 500,
        }
    }
}

/// Result type for facade operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
