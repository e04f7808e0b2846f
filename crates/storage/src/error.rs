//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource temporarily unavailable: {0}")]
    LockContended(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Domain(pantry_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Map an I/O error on `what` into the domain taxonomy.
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(what.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::Conflict(what.to_string()),
            _ => Self::Io(err),
        }
    }
}

impl From<StorageError> for pantry_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(s) => Self::NotFound(s),
            StorageError::Conflict(s) => Self::Conflict(s),
            StorageError::LockContended(s) => {
                Self::Internal(format!("resource temporarily unavailable: {s}"))
            }
            StorageError::Cancelled => Self::Internal("operation cancelled".to_string()),
            StorageError::InvalidName(s) => Self::InvalidName(s),
            StorageError::Serialization(s) => Self::Serialization(s),
            StorageError::Domain(e) => e,
            StorageError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<pantry_core::Error> for StorageError {
    fn from(err: pantry_core::Error) -> Self {
        match err {
            pantry_core::Error::InvalidName(s) => Self::InvalidName(s),
            pantry_core::Error::Serialization(s) => Self::Serialization(s),
            other => Self::Domain(other),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
