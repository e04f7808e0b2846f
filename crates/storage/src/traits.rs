//! The local package storage plugin contract.
//!
//! The core ships a filesystem implementation ([`crate::FilesystemStorage`]);
//! any type satisfying [`PackageStorage`] can replace it.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use pantry_core::{Manifest, PackageName};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A boxed stream of bytes for streaming tarball reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Manifest transform applied under the exclusive per-package lock.
pub type Transform = Box<dyn FnOnce(Manifest) -> Result<Manifest, pantry_core::Error> + Send>;

/// A tarball read: the byte stream plus the size known before the first
/// byte (from `fstat` at open time).
pub struct TarballReader {
    pub stream: ByteStream,
    pub content_length: u64,
}

impl std::fmt::Debug for TarballReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarballReader")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Streaming tarball upload.
///
/// Bytes stage to `<filename>.tmp-<rand>`; `finish` publishes the file
/// atomically under its final name, `abort` removes the staging file.
/// Exactly one of `finish`/`abort` must be called.
#[async_trait]
pub trait TarballUpload: Send {
    /// Append a chunk of data to the staging file.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Publish the staged file and return the total bytes written.
    /// Fails with a conflict if the final name appeared concurrently.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard the staged file.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

impl std::fmt::Debug for dyn TarballUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn TarballUpload>")
    }
}

/// Per-package storage operations plus the local package database backing
/// private-package enumeration.
#[async_trait]
pub trait PackageStorage: Send + Sync + 'static {
    /// Read and parse the manifest document.
    async fn read_package(&self, name: &PackageName) -> StorageResult<Manifest>;

    /// Atomic create-if-absent; a package that already exists is a conflict.
    async fn create_package(&self, name: &PackageName, manifest: &Manifest) -> StorageResult<()>;

    /// Unconditional overwrite via temp-file + rename. Not safe against
    /// concurrent writers; use [`Self::update_package`] for that.
    async fn save_package(&self, name: &PackageName, manifest: &Manifest) -> StorageResult<()>;

    /// Serialized read-modify-write under an exclusive advisory lock.
    /// Returns the manifest as persisted.
    async fn update_package(
        &self,
        name: &PackageName,
        transform: Transform,
    ) -> StorageResult<Manifest>;

    /// Remove the manifest document only.
    async fn delete_package(&self, name: &PackageName) -> StorageResult<()>;

    /// Remove the package directory and everything in it.
    async fn remove_package(&self, name: &PackageName) -> StorageResult<()>;

    async fn has_package(&self, name: &PackageName) -> StorageResult<bool>;

    /// Open a streaming upload for a tarball. Emits a conflict if the
    /// final filename already exists at open time.
    async fn write_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        cancel: CancellationToken,
    ) -> StorageResult<Box<dyn TarballUpload>>;

    /// Open a tarball for streaming reads; size is resolved before the
    /// first byte. Cancellation closes the underlying descriptor.
    async fn read_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        cancel: CancellationToken,
    ) -> StorageResult<TarballReader>;

    async fn has_tarball(&self, name: &PackageName, filename: &str) -> StorageResult<bool>;

    /// Remove a published tarball.
    async fn delete_tarball(&self, name: &PackageName, filename: &str) -> StorageResult<()>;

    /// Record a locally published package in the database.
    async fn register_local(&self, name: &PackageName) -> StorageResult<()>;

    /// Remove a package from the local database.
    async fn unregister_local(&self, name: &PackageName) -> StorageResult<()>;

    /// Enumerate locally published packages.
    async fn list_local(&self) -> StorageResult<Vec<PackageName>>;
}
