//! One configured upstream registry.

use crate::error::{UplinkError, UplinkResult};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use pantry_core::{now_millis, Manifest, PackageName, UplinkConfig, UplinkRecord};
use reqwest::header;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Name given to uplinks synthesized for tarball URLs with no matching
/// configured uplink. Such uplinks never appear in `_uplinks`.
pub const ADHOC_UPNAME: &str = "(adhoc)";

/// A boxed stream of tarball bytes from an upstream.
pub type RemoteByteStream = Pin<Box<dyn Stream<Item = UplinkResult<Bytes>> + Send>>;

/// A streaming tarball response.
pub struct RemoteTarball {
    pub stream: RemoteByteStream,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for RemoteTarball {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTarball")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Options for a conditional metadata fetch.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// ETag from the previous fetch, sent as `If-None-Match`.
    pub etag: Option<String>,
    /// Originating client address, forwarded upstream.
    pub remote_address: Option<String>,
}

/// An upstream registry proxy: conditional manifest fetch plus tarball
/// streaming, under one timeout budget.
pub struct Uplink {
    upname: String,
    base: reqwest::Url,
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
    maxage_ms: u64,
    cache: bool,
}

impl Uplink {
    /// Build an uplink from configuration.
    pub fn from_config(upname: impl Into<String>, config: &UplinkConfig) -> UplinkResult<Self> {
        let base = reqwest::Url::parse(&config.url)
            .map_err(|e| UplinkError::Url(format!("{}: {e}", config.url)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(UplinkError::from)?;

        Ok(Self {
            upname: upname.into(),
            base,
            client,
            headers: config.headers.clone(),
            maxage_ms: config.maxage_ms,
            cache: config.cache,
        })
    }

    /// Synthesize an ephemeral uplink for a bare tarball URL. Caching is
    /// always enabled; the uplink takes part in no manifest syncs.
    pub fn adhoc(url: &str, timeout_ms: u64) -> UplinkResult<Self> {
        let config = UplinkConfig {
            url: url.to_string(),
            timeout_ms,
            cache: true,
            ..Default::default()
        };
        Self::from_config(ADHOC_UPNAME, &config)
    }

    pub fn upname(&self) -> &str {
        &self.upname
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache
    }

    pub fn maxage_ms(&self) -> u64 {
        self.maxage_ms
    }

    /// Whether the cached copy behind `record` is still within the
    /// freshness window.
    pub fn is_fresh(&self, record: Option<&UplinkRecord>) -> bool {
        match record.and_then(|r| r.fetched) {
            Some(fetched) => now_millis().saturating_sub(fetched) < self.maxage_ms,
            None => false,
        }
    }

    /// Stamp a freshness record after a successful fetch (304 included).
    pub fn stamp(&self, record: &mut UplinkRecord, etag: Option<String>) {
        if etag.is_some() {
            record.etag = etag;
        }
        record.fetched = Some(now_millis());
    }

    /// Conditional metadata GET.
    ///
    /// Returns the parsed manifest and the response ETag. A `304` surfaces
    /// as [`UplinkError::NotModified`]; the merge engine treats it as
    /// success-with-no-body. The body is validated: well-formed JSON whose
    /// `name` matches the requested package.
    #[instrument(skip(self, options), fields(uplink = %self.upname, package = %name))]
    pub async fn get_remote_metadata(
        &self,
        name: &PackageName,
        options: &FetchOptions,
    ) -> UplinkResult<(Manifest, Option<String>)> {
        let url = self.metadata_url(name)?;

        let mut request = self.client.get(url).header(header::ACCEPT, "application/json");
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(etag) = &options.etag {
            request = request.header(header::IF_NONE_MATCH, etag.as_str());
        }
        if let Some(addr) = &options.remote_address {
            request = request.header("x-forwarded-for", addr.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Err(UplinkError::NotModified);
        }
        if !status.is_success() {
            return Err(UplinkError::RemoteStatus {
                status: status.as_u16(),
            });
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await?;
        let manifest: Manifest = serde_json::from_slice(&body)
            .map_err(|e| UplinkError::Validation(format!("malformed manifest: {e}")))?;

        if manifest.name != name.to_string() {
            return Err(UplinkError::Validation(format!(
                "name mismatch: requested {name}, got {:?}",
                manifest.name
            )));
        }

        Ok((manifest, etag))
    }

    /// Stream a tarball. The caller must consume or cancel the stream.
    #[instrument(skip(self, cancel), fields(uplink = %self.upname, url))]
    pub async fn fetch_tarball(
        &self,
        url: &str,
        cancel: CancellationToken,
    ) -> UplinkResult<RemoteTarball> {
        let url = reqwest::Url::parse(url).map_err(|e| UplinkError::Url(format!("{url}: {e}")))?;

        let mut request = self.client.get(url);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UplinkError::RemoteStatus {
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length();
        let mut body = response.bytes_stream();

        let stream = async_stream::try_stream! {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        yield Err(UplinkError::Cancelled)?;
                    }
                    next = body.next() => {
                        match next {
                            Some(chunk) => yield chunk.map_err(UplinkError::from)?,
                            None => break,
                        }
                    }
                }
            }
        };

        Ok(RemoteTarball {
            stream: Box::pin(stream),
            content_length,
        })
    }

    /// Metadata URL for a package; the scope separator is percent-encoded
    /// the way npm registries expect.
    fn metadata_url(&self, name: &PackageName) -> UplinkResult<reqwest::Url> {
        let segment = name.to_string().replace('/', "%2F");
        let joined = format!("{}/{}", self.base.as_str().trim_end_matches('/'), segment);
        reqwest::Url::parse(&joined).map_err(|e| UplinkError::Url(format!("{joined}: {e}")))
    }
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("upname", &self.upname)
            .field("base", &self.base.as_str())
            .field("maxage_ms", &self.maxage_ms)
            .field("cache", &self.cache)
            .finish()
    }
}
