//! Local package storage for pantry.
//!
//! This crate provides:
//! - The storage plugin contract ([`PackageStorage`])
//! - Streaming tarball reads and conflict-safe streaming writes
//! - Advisory per-manifest locking for read-modify-write
//! - The shipped filesystem implementation

pub mod backends;
pub mod error;
pub mod lock;
pub mod traits;

pub use backends::filesystem::FilesystemStorage;
pub use error::{StorageError, StorageResult};
pub use lock::PathLock;
pub use traits::{ByteStream, PackageStorage, TarballReader, TarballUpload, Transform};

use pantry_core::RegistryConfig;
use std::sync::Arc;

/// Create the storage plugin from configuration.
pub async fn from_config(config: &RegistryConfig) -> StorageResult<Arc<dyn PackageStorage>> {
    let backend = FilesystemStorage::new(&config.storage).await?;
    Ok(Arc::new(backend))
}
