//! The tarball pipeline: local-first streaming with write-through caching
//! on upstream fallback.
//!
//! The caller only ever sees upstream bytes; the cache writer is a second
//! leg of the tee and can fail without affecting the response. A single
//! cancellation token aborts the local reader, the upstream transfer, and
//! the cache writer.

use crate::error::{RegistryError, RegistryResult};
use crate::facade::Registry;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use pantry_core::PackageName;
use pantry_storage::{StorageError, TarballReader, TarballUpload};
use pantry_uplink::{RemoteTarball, Uplink};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Timeout budget for uplinks synthesized from a bare tarball URL.
const ADHOC_TIMEOUT_MS: u64 = 30_000;

/// Channel depth between the upstream pump and the caller; bounds
/// buffering so a slow caller backpressures the transfer.
const TEE_CHANNEL_DEPTH: usize = 8;

/// A boxed stream of tarball bytes handed to the routing layer.
pub type TarballByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RegistryError>> + Send>>;

/// A tarball response: byte stream plus size when known up front.
pub struct TarballStream {
    pub stream: TarballByteStream,
    /// Known for local reads; upstream fallbacks carry it only when the
    /// remote answered with a content length.
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for TarballStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarballStream")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Options for a tarball request.
#[derive(Clone, Debug)]
pub struct TarballOptions {
    /// Fall back to the upstream locator on a local miss.
    pub enable_remote: bool,
    /// Aborts every leg of the pipeline when triggered.
    pub cancel: CancellationToken,
}

impl Default for TarballOptions {
    fn default() -> Self {
        Self {
            enable_remote: true,
            cancel: CancellationToken::new(),
        }
    }
}

impl Registry {
    #[instrument(skip(self, options), fields(package = %name, filename))]
    pub(crate) async fn stream_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        options: TarballOptions,
    ) -> RegistryResult<TarballStream> {
        // The filesystem is always probed first; only a confirmed local
        // miss consults `_distfiles`.
        match self
            .storage()
            .read_tarball(name, filename, options.cancel.clone())
            .await
        {
            Ok(reader) => Ok(local_stream(reader)),
            Err(StorageError::NotFound(_)) if options.enable_remote => {
                self.stream_remote_tarball(name, filename, options.cancel)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Upstream fallback: resolve the locator, elect an uplink, and tee
    /// the transfer into the caller and the local cache.
    async fn stream_remote_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        cancel: CancellationToken,
    ) -> RegistryResult<TarballStream> {
        let manifest = self.storage().read_package(name).await.map_err(|e| match e {
            StorageError::NotFound(_) => RegistryError::not_found(format!("{name}/{filename}")),
            other => other.into(),
        })?;

        let dist_file = manifest
            .dist_files
            .get(filename)
            .ok_or_else(|| RegistryError::not_found(format!("{name}/{filename}")))?;

        let uplink = self.elect_tarball_uplink(name, &dist_file.url)?;

        // Response headers first; the cache writer opens before any body
        // byte is consumed, so a pre-existing file conflicts up front.
        let remote = uplink.fetch_tarball(&dist_file.url, cancel.clone()).await?;

        let writer = if uplink.cache_enabled() {
            match self
                .storage()
                .write_tarball(name, filename, cancel.clone())
                .await
            {
                Ok(writer) => Some(writer),
                Err(e) => {
                    // A failed writer never fails the response.
                    warn!(package = %name, filename, error = %e, "cache writer unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(tee_remote(remote, writer))
    }

    /// The uplink whose proxy rule matches the package; a URL with no
    /// responsible uplink gets an ephemeral one, caching enabled.
    fn elect_tarball_uplink(&self, name: &PackageName, url: &str) -> RegistryResult<Arc<Uplink>> {
        if let Some(uplink) = self.uplinks_for(name).into_iter().next() {
            return Ok(uplink);
        }
        Ok(Arc::new(Uplink::adhoc(url, ADHOC_TIMEOUT_MS)?))
    }
}

fn local_stream(reader: TarballReader) -> TarballStream {
    let content_length = reader.content_length;
    let stream = reader.stream.map(|item| item.map_err(RegistryError::from));
    TarballStream {
        stream: Box::pin(stream),
        content_length: Some(content_length),
    }
}

/// Pump upstream bytes into both the caller and the cache writer.
///
/// Upstream end finishes the writer (publishing the cached file);
/// upstream error, cancellation, or a dropped caller aborts it.
fn tee_remote(mut remote: RemoteTarball, mut writer: Option<Box<dyn TarballUpload>>) -> TarballStream {
    let content_length = remote.content_length;
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, RegistryError>>(TEE_CHANNEL_DEPTH);

    tokio::spawn(async move {
        while let Some(item) = remote.stream.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(active) = writer.as_mut() {
                        if let Err(e) = active.write(chunk.clone()).await {
                            warn!(error = %e, "cache write failed, streaming without cache");
                            if let Some(failed) = writer.take() {
                                let _ = failed.abort().await;
                            }
                        }
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Caller went away; nothing partial may survive.
                        if let Some(active) = writer.take() {
                            let _ = active.abort().await;
                        }
                        return;
                    }
                }
                Err(e) => {
                    if let Some(active) = writer.take() {
                        let _ = active.abort().await;
                    }
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }

        if let Some(active) = writer.take() {
            match active.finish().await {
                Ok(bytes) => tracing::debug!(bytes, "tarball cached"),
                Err(e) => warn!(error = %e, "failed to publish cached tarball"),
            }
        }
    });

    let stream = async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    };

    TarballStream {
        stream: Box::pin(stream),
        content_length,
    }
}
