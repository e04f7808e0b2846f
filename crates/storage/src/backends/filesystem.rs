//! Filesystem storage plugin.
//!
//! Layout per package (scoped names nest one directory deep):
//!
//! ```text
//! <root>/<name>/package.json
//! <root>/<name>/<tarball-filename>
//! <root>/<name>/<tarball-filename>.tmp-<rand>
//! <root>/<name>/package.json.tmp-<rand>
//! ```
//!
//! Manifest writes stage to a temp file and rename into place, so readers
//! observe either the pre- or post-state, never a torn document.

use crate::error::{StorageError, StorageResult};
use crate::lock::PathLock;
use crate::traits::{PackageStorage, TarballReader, TarballUpload, Transform};
use async_trait::async_trait;
use bytes::Bytes;
use pantry_core::{sanitize_filename, Manifest, PackageName};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming tarball reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Manifest document filename inside a package directory.
const MANIFEST_FILE: &str = "package.json";

/// Local package database filename under the storage root.
const DB_FILE: &str = ".pantry-db.json";

/// The shipped filesystem implementation of [`PackageStorage`].
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Create a filesystem plugin rooted at `root` (created if absent).
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn package_dir(&self, name: &PackageName) -> PathBuf {
        self.root.join(name.storage_path())
    }

    fn manifest_path(&self, name: &PackageName) -> PathBuf {
        self.package_dir(name).join(MANIFEST_FILE)
    }

    fn tarball_path(&self, name: &PackageName, filename: &str) -> StorageResult<PathBuf> {
        let safe = sanitize_filename(filename)?;
        Ok(self.package_dir(name).join(safe))
    }

    fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    async fn ensure_package_dir(&self, name: &PackageName) -> StorageResult<()> {
        fs::create_dir_all(self.package_dir(name)).await?;
        Ok(())
    }

    /// Write `bytes` to `<path>.tmp-<rand>`, fsync, then rename into place.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let temp_path = temp_sibling(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            rename_with_fallback(&temp_path, path).await
        }
        .await;

        if result.is_err() {
            // Cleanup never masks the primary error.
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn read_manifest(&self, name: &PackageName) -> StorageResult<Manifest> {
        let path = self.manifest_path(name);
        let bytes = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(e, &name.to_string()))?;
        Ok(Manifest::from_json_slice(&bytes)?)
    }

    async fn read_db(&self) -> StorageResult<LocalDatabase> {
        match fs::read(self.db_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Serialization(format!("local database: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LocalDatabase::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Read-modify-write on the local database, serialized by its own lock.
    async fn update_db<F>(&self, mutate: F) -> StorageResult<()>
    where
        F: FnOnce(&mut LocalDatabase),
    {
        let path = self.db_path();
        let lock = PathLock::acquire(&path).await?;

        let result = async {
            let mut db = self.read_db().await?;
            mutate(&mut db);
            let bytes = serde_json::to_vec_pretty(&db)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            self.write_atomic(&path, &bytes).await
        }
        .await;

        finish_locked(lock, result)
    }
}

#[async_trait]
impl PackageStorage for FilesystemStorage {
    #[instrument(skip(self), fields(package = %name))]
    async fn read_package(&self, name: &PackageName) -> StorageResult<Manifest> {
        self.read_manifest(name).await
    }

    #[instrument(skip(self, manifest), fields(package = %name))]
    async fn create_package(&self, name: &PackageName, manifest: &Manifest) -> StorageResult<()> {
        self.ensure_package_dir(name).await?;
        let path = self.manifest_path(name);

        // Open-exclusive claims the name; exactly one concurrent creator
        // wins and the rest observe the claim.
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::from_io(e, &name.to_string()))?;

        let bytes = manifest.to_canonical_json()?;
        self.write_atomic(&path, &bytes).await
    }

    #[instrument(skip(self, manifest), fields(package = %name))]
    async fn save_package(&self, name: &PackageName, manifest: &Manifest) -> StorageResult<()> {
        self.ensure_package_dir(name).await?;
        let bytes = manifest.to_canonical_json()?;
        self.write_atomic(&self.manifest_path(name), &bytes).await
    }

    #[instrument(skip(self, transform), fields(package = %name))]
    async fn update_package(
        &self,
        name: &PackageName,
        transform: Transform,
    ) -> StorageResult<Manifest> {
        let path = self.manifest_path(name);
        let lock = PathLock::acquire(&path).await?;

        let result = async {
            let manifest = self.read_manifest(name).await?;
            let updated = transform(manifest).map_err(StorageError::from)?;
            let bytes = updated.to_canonical_json()?;
            self.write_atomic(&path, &bytes).await?;
            Ok(updated)
        }
        .await;

        finish_locked(lock, result)
    }

    #[instrument(skip(self), fields(package = %name))]
    async fn delete_package(&self, name: &PackageName) -> StorageResult<()> {
        fs::remove_file(self.manifest_path(name))
            .await
            .map_err(|e| StorageError::from_io(e, &name.to_string()))
    }

    #[instrument(skip(self), fields(package = %name))]
    async fn remove_package(&self, name: &PackageName) -> StorageResult<()> {
        fs::remove_dir_all(self.package_dir(name))
            .await
            .map_err(|e| StorageError::from_io(e, &name.to_string()))
    }

    async fn has_package(&self, name: &PackageName) -> StorageResult<bool> {
        fs::try_exists(self.manifest_path(name))
            .await
            .map_err(StorageError::Io)
    }

    #[instrument(skip(self, cancel), fields(package = %name, filename))]
    async fn write_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        cancel: CancellationToken,
    ) -> StorageResult<Box<dyn TarballUpload>> {
        let final_path = self.tarball_path(name, filename)?;
        self.ensure_package_dir(name).await?;

        // Fast-fail before any byte is consumed; the publish step still
        // enforces exclusivity if a writer appears concurrently.
        if fs::try_exists(&final_path).await? {
            return Err(StorageError::Conflict(format!("{name}/{filename}")));
        }

        let temp_path = temp_sibling(&final_path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FsTarballUpload {
            file: Some(file),
            temp_path,
            final_path,
            cancel,
            bytes_written: 0,
            settled: false,
        }))
    }

    #[instrument(skip(self, cancel), fields(package = %name, filename))]
    async fn read_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        cancel: CancellationToken,
    ) -> StorageResult<TarballReader> {
        use tokio::io::AsyncReadExt;

        let path = self.tarball_path(name, filename)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(e, &format!("{name}/{filename}")))?;

        let meta = file.metadata().await?;
        let content_length = meta.len();
        if content_length == 0 {
            // Crash residue from an interrupted publish is not a tarball.
            return Err(StorageError::NotFound(format!("{name}/{filename}")));
        }

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                if cancel.is_cancelled() {
                    Err(StorageError::Cancelled)?;
                }
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(TarballReader {
            stream: Box::pin(stream),
            content_length,
        })
    }

    async fn has_tarball(&self, name: &PackageName, filename: &str) -> StorageResult<bool> {
        let path = self.tarball_path(name, filename)?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(package = %name, filename))]
    async fn delete_tarball(&self, name: &PackageName, filename: &str) -> StorageResult<()> {
        let path = self.tarball_path(name, filename)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::from_io(e, &format!("{name}/{filename}")))
    }

    #[instrument(skip(self), fields(package = %name))]
    async fn register_local(&self, name: &PackageName) -> StorageResult<()> {
        let entry = name.to_string();
        self.update_db(move |db| {
            if !db.list.contains(&entry) {
                db.list.push(entry);
                db.list.sort();
            }
        })
        .await
    }

    #[instrument(skip(self), fields(package = %name))]
    async fn unregister_local(&self, name: &PackageName) -> StorageResult<()> {
        let entry = name.to_string();
        self.update_db(move |db| db.list.retain(|n| n != &entry)).await
    }

    async fn list_local(&self) -> StorageResult<Vec<PackageName>> {
        let db = self.read_db().await?;
        let mut names = Vec::with_capacity(db.list.len());
        for raw in db.list {
            match PackageName::parse(&raw) {
                Ok(name) => names.push(name),
                Err(e) => tracing::warn!(package = %raw, error = %e, "skipping invalid database entry"),
            }
        }
        Ok(names)
    }
}

/// On-disk shape of the local package database.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalDatabase {
    #[serde(default)]
    list: Vec<String>,
}

/// `<path>.tmp-<rand>` next to the target.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.tmp-{}", Uuid::new_v4().simple()))
}

/// Rename `from` over `to`, falling back to the move-aside protocol on
/// platforms that refuse to replace an open target (Windows semantics,
/// detected by the failure rather than by cfg).
async fn rename_with_fallback(from: &Path, to: &Path) -> StorageResult<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AlreadyExists
            ) =>
        {
            let displaced = temp_sibling(to);
            fs::rename(to, &displaced).await?;
            if let Err(rename_err) = fs::rename(from, to).await {
                // Put the original back so readers still see a document.
                let _ = fs::rename(&displaced, to).await;
                return Err(StorageError::Io(rename_err));
            }
            let _ = fs::remove_file(&displaced).await;
            Ok(())
        }
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Release `lock` on every exit path; an unlock failure after a failed
/// body wraps the original error as resource-unavailable.
fn finish_locked<T>(lock: PathLock, result: StorageResult<T>) -> StorageResult<T> {
    match result {
        Ok(value) => {
            lock.release()?;
            Ok(value)
        }
        Err(err) => match lock.release() {
            Ok(()) => Err(err),
            Err(_) => Err(StorageError::LockContended(err.to_string())),
        },
    }
}

/// Streaming tarball upload staging to `<filename>.tmp-<rand>`.
struct FsTarballUpload {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    cancel: CancellationToken,
    bytes_written: u64,
    settled: bool,
}

#[async_trait]
impl TarballUpload for FsTarballUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("upload already settled")))?;
        file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if self.cancel.is_cancelled() {
            self.cleanup().await;
            return Err(StorageError::Cancelled);
        }

        if let Some(file) = self.file.take() {
            file.sync_all().await?;
            drop(file);
        }

        // hard_link is create-exclusive at the final name, so exactly one
        // of N concurrent writers publishes; rename would silently replace.
        let publish = fs::hard_link(&self.temp_path, &self.final_path).await;
        let _ = fs::remove_file(&self.temp_path).await;
        self.settled = true;

        match publish {
            Ok(()) => Ok(self.bytes_written),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StorageError::Conflict(
                self.final_path.display().to_string(),
            )),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.cleanup().await;
        Ok(())
    }
}

impl FsTarballUpload {
    async fn cleanup(&mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.temp_path).await;
        self.settled = true;
    }
}

impl Drop for FsTarballUpload {
    fn drop(&mut self) {
        // Leaked uploads (dropped without finish/abort) must not leave
        // staging files behind.
        if !self.settled {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn pkg(name: &str) -> PackageName {
        PackageName::parse(name).unwrap()
    }

    async fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemStorage::new(dir.path()).await.unwrap();
        (dir, fs)
    }

    async fn collect(mut reader: TarballReader) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn create_read_roundtrip() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");
        let manifest = Manifest::empty(&name);

        store.create_package(&name, &manifest).await.unwrap();
        let read = store.read_package(&name).await.unwrap();
        assert_eq!(read, manifest);
        assert!(store.has_package(&name).await.unwrap());
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");
        let manifest = Manifest::empty(&name);

        store.create_package(&name, &manifest).await.unwrap();
        match store.create_package(&name, &manifest).await {
            Err(StorageError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_package_overwrites() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");
        let mut manifest = Manifest::empty(&name);
        store.save_package(&name, &manifest).await.unwrap();

        manifest
            .dist_tags
            .insert("latest".to_string(), "1.0.0".to_string());
        store.save_package(&name, &manifest).await.unwrap();

        let read = store.read_package(&name).await.unwrap();
        assert_eq!(read.dist_tags["latest"], "1.0.0");
    }

    #[tokio::test]
    async fn delete_package_removes_manifest_only() {
        let (dir, store) = storage().await;
        let name = pkg("demo");
        store
            .create_package(&name, &Manifest::empty(&name))
            .await
            .unwrap();
        let mut upload = store
            .write_tarball(&name, "t.tgz", CancellationToken::new())
            .await
            .unwrap();
        upload.write(Bytes::from_static(b"x")).await.unwrap();
        upload.finish().await.unwrap();

        store.delete_package(&name).await.unwrap();
        assert!(!store.has_package(&name).await.unwrap());
        assert!(store.has_tarball(&name, "t.tgz").await.unwrap());
        assert!(dir.path().join("demo").exists());
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (_dir, store) = storage().await;
        match store.read_package(&pkg("ghost")).await {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_package_applies_transform() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");
        store
            .create_package(&name, &Manifest::empty(&name))
            .await
            .unwrap();

        let updated = store
            .update_package(
                &name,
                Box::new(|mut m| {
                    m.dist_tags
                        .insert("latest".to_string(), "1.0.0".to_string());
                    Ok(m)
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.dist_tags["latest"], "1.0.0");
        let read = store.read_package(&name).await.unwrap();
        assert_eq!(read, updated);
    }

    #[tokio::test]
    async fn update_missing_package_is_not_found() {
        let (_dir, store) = storage().await;
        let result = store.update_package(&pkg("ghost"), Box::new(|m| Ok(m))).await;
        match result {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_releases_lock_on_transform_failure() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");
        store
            .create_package(&name, &Manifest::empty(&name))
            .await
            .unwrap();

        let result = store
            .update_package(
                &name,
                Box::new(|_| Err(pantry_core::Error::Conflict("revision mismatch".into()))),
            )
            .await;
        assert!(result.is_err());

        // Lock released: the next update proceeds.
        store
            .update_package(&name, Box::new(|m| Ok(m)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tarball_write_read_roundtrip() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");

        let mut upload = store
            .write_tarball(&name, "demo-1.0.0.tgz", CancellationToken::new())
            .await
            .unwrap();
        upload.write(Bytes::from_static(b"tar ")).await.unwrap();
        upload.write(Bytes::from_static(b"bytes")).await.unwrap();
        let written = upload.finish().await.unwrap();
        assert_eq!(written, 9);

        let reader = store
            .read_tarball(&name, "demo-1.0.0.tgz", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reader.content_length, 9);
        assert_eq!(collect(reader).await, b"tar bytes");
    }

    #[tokio::test]
    async fn tarball_conflict_at_open() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");

        let mut upload = store
            .write_tarball(&name, "t.tgz", CancellationToken::new())
            .await
            .unwrap();
        upload.write(Bytes::from_static(b"x")).await.unwrap();
        upload.finish().await.unwrap();

        match store
            .write_tarball(&name, "t.tgz", CancellationToken::new())
            .await
        {
            Err(StorageError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tarball_abort_removes_staging() {
        let (dir, store) = storage().await;
        let name = pkg("demo");

        let mut upload = store
            .write_tarball(&name, "t.tgz", CancellationToken::new())
            .await
            .unwrap();
        upload.write(Bytes::from_static(b"partial")).await.unwrap();
        upload.abort().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("demo"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(entries.is_empty(), "leftover files: {entries:?}");
    }

    #[tokio::test]
    async fn cancelled_write_fails_and_cleans_up() {
        let (dir, store) = storage().await;
        let name = pkg("demo");
        let cancel = CancellationToken::new();

        let mut upload = store
            .write_tarball(&name, "t.tgz", cancel.clone())
            .await
            .unwrap();
        upload.write(Bytes::from_static(b"some")).await.unwrap();
        cancel.cancel();
        match upload.write(Bytes::from_static(b"more")).await {
            Err(StorageError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        upload.abort().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("demo"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(entries.is_empty(), "leftover files: {entries:?}");
    }

    #[tokio::test]
    async fn zero_length_tarball_is_not_found() {
        let (dir, store) = storage().await;
        let name = pkg("demo");
        std::fs::create_dir_all(dir.path().join("demo")).unwrap();
        std::fs::write(dir.path().join("demo/t.tgz"), b"").unwrap();

        match store
            .read_tarball(&name, "t.tgz", CancellationToken::new())
            .await
        {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn filenames_with_separators_rejected() {
        let (_dir, store) = storage().await;
        let name = pkg("demo");
        for bad in ["../escape.tgz", "a/b.tgz", "nul\0.tgz"] {
            match store
                .read_tarball(&name, bad, CancellationToken::new())
                .await
            {
                Err(StorageError::InvalidName(_)) => {}
                other => panic!("expected InvalidName for {bad:?}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn scoped_package_nests_directories() {
        let (dir, store) = storage().await;
        let name = pkg("@scope/demo");
        store
            .create_package(&name, &Manifest::empty(&name))
            .await
            .unwrap();
        assert!(dir.path().join("@scope/demo/package.json").exists());
    }

    #[tokio::test]
    async fn local_database_roundtrip() {
        let (_dir, store) = storage().await;
        store.register_local(&pkg("b")).await.unwrap();
        store.register_local(&pkg("a")).await.unwrap();
        store.register_local(&pkg("a")).await.unwrap();

        let names: Vec<String> = store
            .list_local()
            .await
            .unwrap()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, ["a", "b"]);

        store.unregister_local(&pkg("a")).await.unwrap();
        let names = store.list_local().await.unwrap();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn remove_package_deletes_directory() {
        let (dir, store) = storage().await;
        let name = pkg("demo");
        store
            .create_package(&name, &Manifest::empty(&name))
            .await
            .unwrap();
        store.remove_package(&name).await.unwrap();
        assert!(!dir.path().join("demo").exists());
    }
}
