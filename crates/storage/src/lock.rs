//! Advisory file locking for manifest read-modify-write.
//!
//! Locks are taken on a `.lock` sidecar next to the manifest, not on the
//! manifest itself: the manifest is replaced by rename, which would detach
//! a lock held on the displaced inode. OS `flock` semantics serialize
//! holders both across processes and across tasks within this process.

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lock acquisition attempts before surfacing contention.
const MAX_ATTEMPTS: u32 = 10;

/// Backoff base; attempt `n` waits `n * BACKOFF_STEP`.
const BACKOFF_STEP: Duration = Duration::from_millis(10);

/// An exclusive advisory lock on a path, held until [`PathLock::release`]
/// or drop.
#[derive(Debug)]
pub struct PathLock {
    file: Option<std::fs::File>,
    path: PathBuf,
}

impl PathLock {
    /// Acquire the lock, retrying with bounded backoff. Contention past
    /// the retry budget surfaces as [`StorageError::LockContended`].
    pub async fn acquire(target: &Path) -> StorageResult<Self> {
        let path = lock_path(target);

        for attempt in 1..=MAX_ATTEMPTS {
            let candidate = path.clone();
            let outcome = tokio::task::spawn_blocking(move || try_acquire(&candidate))
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

            match outcome {
                Some(file) => {
                    return Ok(Self {
                        file: Some(file),
                        path,
                    })
                }
                None if attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(BACKOFF_STEP * attempt).await;
                }
                None => break,
            }
        }

        Err(StorageError::LockContended(path.display().to_string()))
    }

    /// Release explicitly, surfacing unlock failures (drop swallows them).
    pub fn release(mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.unlock()
                .map_err(|e| StorageError::LockContended(format!("unlock failed: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// Sidecar lock path for a target file.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".lock");
    target.with_file_name(name)
}

/// One non-blocking acquisition attempt. `Ok(None)` means contended.
fn try_acquire(path: &Path) -> StorageResult<Option<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(path)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}
