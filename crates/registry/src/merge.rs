//! The manifest merge engine.
//!
//! Fans out conditional fetches to every uplink with proxy access to the
//! package, then integrates the responses into the local manifest under
//! the per-manifest lock. Per-uplink failures are recorded, never fatal;
//! only a package that exists nowhere escalates to an error.

use crate::error::{RegistryError, RegistryResult};
use crate::facade::Registry;
use crate::filters::{FilterError, VersionOrigins};
use pantry_core::{now_millis, Manifest, PackageName};
use pantry_storage::StorageError;
use pantry_uplink::{FetchOptions, Uplink, UplinkError};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// Options for a manifest sync.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// When false, no uplink is consulted and the local manifest is
    /// returned unchanged.
    pub uplinks_look: bool,
    /// Originating client address, forwarded upstream.
    pub remote_address: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            uplinks_look: true,
            remote_address: None,
        }
    }
}

/// A non-fatal problem recorded during a sync.
#[derive(Debug)]
pub enum SyncIssue {
    Uplink { upname: String, error: UplinkError },
    Filter(FilterError),
}

impl SyncIssue {
    fn is_timeout_class(&self) -> bool {
        matches!(self, Self::Uplink { error, .. } if error.is_timeout_class())
    }
}

/// Result of a manifest sync: the merged document, which uplink supplied
/// each adopted version, and the recovered per-uplink/filter issues.
pub struct SyncOutcome {
    pub manifest: Manifest,
    pub origins: VersionOrigins,
    pub issues: Vec<SyncIssue>,
}

enum FetchResult {
    /// Within the freshness window; no network call was made.
    Fresh,
    /// Conditional fetch answered 304.
    NotModified,
    /// Fresh body and its ETag.
    Updated(Manifest, Option<String>),
    Failed(UplinkError),
}

impl Registry {
    /// Merge the local manifest with every responsible uplink.
    ///
    /// `local` is the current on-disk document, or `None` when the package
    /// has no local state yet.
    #[instrument(skip(self, local, options), fields(package = %name))]
    pub(crate) async fn sync_with_uplinks(
        &self,
        name: &PackageName,
        local: Option<Manifest>,
        options: &SyncOptions,
    ) -> RegistryResult<SyncOutcome> {
        let had_local = local.is_some();
        let base = local.unwrap_or_else(|| Manifest::empty(name));

        let selected = if options.uplinks_look {
            self.uplinks_for(name)
        } else {
            Vec::new()
        };

        let fetches = selected.iter().map(|uplink| {
            let record = base.uplinks.get(uplink.upname()).cloned();
            let fetch_options = FetchOptions {
                etag: record.as_ref().and_then(|r| r.etag.clone()),
                remote_address: options.remote_address.clone(),
            };
            async move {
                if uplink.is_fresh(record.as_ref()) {
                    debug!(uplink = uplink.upname(), "cache hit within maxage");
                    return FetchResult::Fresh;
                }
                match uplink.get_remote_metadata(name, &fetch_options).await {
                    Ok((manifest, etag)) => FetchResult::Updated(manifest, etag),
                    Err(e) if e.is_not_modified() => FetchResult::NotModified,
                    Err(e) => FetchResult::Failed(e),
                }
            }
        });
        let results = futures::future::join_all(fetches).await;

        // Integrate in configured order: the first uplink to supply a
        // version wins.
        let mut issues = Vec::new();
        let mut refreshed: Vec<String> = Vec::new();
        let mut updates: Vec<(String, bool, Manifest, Option<String>)> = Vec::new();
        let mut found_remote = false;

        for (uplink, result) in selected.iter().zip(results) {
            match result {
                FetchResult::Fresh => {}
                FetchResult::NotModified => {
                    refreshed.push(uplink.upname().to_string());
                    found_remote = true;
                }
                FetchResult::Updated(manifest, etag) => {
                    updates.push((
                        uplink.upname().to_string(),
                        uplink.cache_enabled(),
                        manifest,
                        etag,
                    ));
                    found_remote = true;
                }
                FetchResult::Failed(error) => {
                    debug!(uplink = uplink.upname(), error = %error, "uplink fetch failed");
                    issues.push(SyncIssue::Uplink {
                        upname: uplink.upname().to_string(),
                        error,
                    });
                }
            }
        }

        if !had_local && !found_remote {
            return Err(escalate(name, &issues));
        }

        let dirty = !refreshed.is_empty() || !updates.is_empty();
        let (merged, origins) = if dirty {
            self.persist_merge(name, had_local, &base, refreshed, updates)
                .await?
        } else {
            (base, VersionOrigins::default())
        };

        // Filters run serially on the response copy; failures are
        // recorded alongside the uplink issues.
        let mut manifest = merged;
        for filter in self.filters() {
            if let Err(e) = filter.filter(&mut manifest, &origins).await {
                issues.push(SyncIssue::Filter(e));
            }
        }

        manifest.normalize_dist_tags();
        manifest.clear_attachments();

        Ok(SyncOutcome {
            manifest,
            origins,
            issues,
        })
    }

    /// Apply the fan-out results to the on-disk manifest under its lock.
    async fn persist_merge(
        &self,
        name: &PackageName,
        had_local: bool,
        base: &Manifest,
        refreshed: Vec<String>,
        updates: Vec<(String, bool, Manifest, Option<String>)>,
    ) -> RegistryResult<(Manifest, VersionOrigins)> {
        if !had_local {
            match self.storage().create_package(name, base).await {
                Ok(()) => {}
                // Another request created it between our read and now;
                // the update below merges into whatever is there.
                Err(StorageError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let origins_cell = Arc::new(Mutex::new(VersionOrigins::default()));
        let cell = origins_cell.clone();

        let merged = self
            .storage()
            .update_package(
                name,
                Box::new(move |mut manifest| {
                    let now = now_millis();
                    for upname in refreshed {
                        manifest.uplinks.entry(upname).or_default().fetched = Some(now);
                    }
                    for (upname, cache, remote, etag) in updates {
                        {
                            let record = manifest.uplinks.entry(upname.clone()).or_default();
                            if etag.is_some() {
                                record.etag = etag;
                            }
                            record.fetched = Some(now);
                        }
                        let adopted = manifest.merge_remote(&remote, cache);
                        let mut origins = cell.lock().expect("origins lock poisoned");
                        for version in adopted {
                            origins.record(version, upname.clone());
                        }
                    }
                    manifest.normalize_dist_tags();
                    Ok(manifest)
                }),
            )
            .await?;

        let origins = origins_cell.lock().expect("origins lock poisoned").clone();
        Ok((merged, origins))
    }

    /// Uplinks with proxy access to `name`, in configured order.
    pub(crate) fn uplinks_for(&self, name: &PackageName) -> Vec<Arc<Uplink>> {
        self.access()
            .proxies_for(&name.to_string())
            .iter()
            .filter_map(|upname| self.uplink_by_name(upname))
            .collect()
    }
}

/// Error for a package that exists nowhere: all-timeout failures
/// escalate to service-unavailable, anything else is not-found.
fn escalate(name: &PackageName, issues: &[SyncIssue]) -> RegistryError {
    if !issues.is_empty() && issues.iter().all(SyncIssue::is_timeout_class) {
        RegistryError::service_unavailable(format!("all uplinks timed out for {name}"))
    } else {
        RegistryError::not_found(name.to_string())
    }
}
