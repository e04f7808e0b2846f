// In-memory implementation of the storage plugin contract. Exercises the
// facade and merge engine against a second plugin, proving the contract
// is not filesystem-shaped.

use async_trait::async_trait;
use bytes::Bytes;
use pantry_core::{Manifest, PackageName};
use pantry_storage::{
    PackageStorage, StorageError, StorageResult, TarballReader, TarballUpload, Transform,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct State {
    manifests: HashMap<String, Manifest>,
    tarballs: HashMap<String, Bytes>,
    local: BTreeSet<String>,
}

/// Everything behind one async mutex; the mutex stands in for the
/// filesystem plugin's per-manifest advisory locks.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tarball_key(name: &PackageName, filename: &str) -> String {
        format!("{name}/{filename}")
    }
}

#[async_trait]
impl PackageStorage for MemoryStorage {
    async fn read_package(&self, name: &PackageName) -> StorageResult<Manifest> {
        let state = self.state.lock().await;
        state
            .manifests
            .get(&name.to_string())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn create_package(&self, name: &PackageName, manifest: &Manifest) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let key = name.to_string();
        if state.manifests.contains_key(&key) {
            return Err(StorageError::Conflict(key));
        }
        state.manifests.insert(key, manifest.clone());
        Ok(())
    }

    async fn save_package(&self, name: &PackageName, manifest: &Manifest) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.manifests.insert(name.to_string(), manifest.clone());
        Ok(())
    }

    async fn update_package(
        &self,
        name: &PackageName,
        transform: Transform,
    ) -> StorageResult<Manifest> {
        let mut state = self.state.lock().await;
        let key = name.to_string();
        let current = state
            .manifests
            .get(&key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        let updated = transform(current).map_err(StorageError::from)?;
        state.manifests.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_package(&self, name: &PackageName) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state
            .manifests
            .remove(&name.to_string())
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn remove_package(&self, name: &PackageName) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let key = name.to_string();
        state.manifests.remove(&key);
        let prefix = format!("{key}/");
        state.tarballs.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn has_package(&self, name: &PackageName) -> StorageResult<bool> {
        let state = self.state.lock().await;
        Ok(state.manifests.contains_key(&name.to_string()))
    }

    async fn write_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        cancel: CancellationToken,
    ) -> StorageResult<Box<dyn TarballUpload>> {
        let key = Self::tarball_key(name, filename);
        let state = self.state.lock().await;
        if state.tarballs.contains_key(&key) {
            return Err(StorageError::Conflict(key));
        }
        Ok(Box::new(MemoryUpload {
            key,
            staged: Vec::new(),
            state: self.state.clone(),
            cancel,
        }))
    }

    async fn read_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        _cancel: CancellationToken,
    ) -> StorageResult<TarballReader> {
        let key = Self::tarball_key(name, filename);
        let state = self.state.lock().await;
        let bytes = state
            .tarballs
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))?;
        let content_length = bytes.len() as u64;
        let stream = futures::stream::once(async move { Ok(bytes) });
        Ok(TarballReader {
            stream: Box::pin(stream),
            content_length,
        })
    }

    async fn has_tarball(&self, name: &PackageName, filename: &str) -> StorageResult<bool> {
        let state = self.state.lock().await;
        Ok(state.tarballs.contains_key(&Self::tarball_key(name, filename)))
    }

    async fn delete_tarball(&self, name: &PackageName, filename: &str) -> StorageResult<()> {
        let key = Self::tarball_key(name, filename);
        let mut state = self.state.lock().await;
        state
            .tarballs
            .remove(&key)
            .map(|_| ())
            .ok_or(StorageError::NotFound(key))
    }

    async fn register_local(&self, name: &PackageName) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.local.insert(name.to_string());
        Ok(())
    }

    async fn unregister_local(&self, name: &PackageName) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.local.remove(&name.to_string());
        Ok(())
    }

    async fn list_local(&self) -> StorageResult<Vec<PackageName>> {
        let state = self.state.lock().await;
        Ok(state
            .local
            .iter()
            .filter_map(|raw| PackageName::parse(raw).ok())
            .collect())
    }
}

struct MemoryUpload {
    key: String,
    staged: Vec<u8>,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

#[async_trait]
impl TarballUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        self.staged.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let mut state = self.state.lock().await;
        if state.tarballs.contains_key(&self.key) {
            return Err(StorageError::Conflict(self.key.clone()));
        }
        let len = self.staged.len() as u64;
        state.tarballs.insert(self.key.clone(), Bytes::from(self.staged));
        Ok(len)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
