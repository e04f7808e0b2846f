//! The storage facade exposed to the routing layer.

use crate::error::{RegistryError, RegistryResult};
use crate::filters::ManifestFilter;
use crate::merge::{SyncIssue, SyncOptions};
use crate::tarball::{TarballOptions, TarballStream};
use futures::future::join_all;
use pantry_core::{
    filename_from_url, now_rfc3339, sanitize_filename, Manifest, PackageAccess, PackageName,
    RegistryConfig, Version,
};
use pantry_storage::{PackageStorage, StorageError};
use pantry_uplink::{FetchOptions, Uplink};
use std::sync::Arc;
use tracing::{instrument, warn};

/// Options for a manifest request.
#[derive(Clone, Debug)]
pub struct GetPackageOptions {
    /// Version or dist-tag to resolve; `None` returns the full manifest.
    pub version: Option<String>,
    /// When false, serve from local state only.
    pub uplinks_look: bool,
    /// Originating client address, forwarded upstream.
    pub remote_address: Option<String>,
}

impl Default for GetPackageOptions {
    fn default() -> Self {
        Self {
            version: None,
            uplinks_look: true,
            remote_address: None,
        }
    }
}

/// A manifest request resolves to the whole document or one version.
#[derive(Clone, Debug)]
pub enum PackageResponse {
    Manifest(Manifest),
    Version(Version),
}

/// The registry facade: public operations over the storage plugin, the
/// uplink table, and the merge engine. The uplink table and access rules
/// are immutable after construction.
pub struct Registry {
    storage: Arc<dyn PackageStorage>,
    uplinks: Vec<Arc<Uplink>>,
    access: PackageAccess,
    filters: Vec<Arc<dyn ManifestFilter>>,
    url_prefix: String,
    allow_offline_publish: bool,
}

impl Registry {
    /// Build the facade from configuration plus its collaborators.
    pub fn new(
        storage: Arc<dyn PackageStorage>,
        uplinks: Vec<Arc<Uplink>>,
        config: &RegistryConfig,
    ) -> RegistryResult<Self> {
        let access = config.compile_access()?;
        Ok(Self {
            storage,
            uplinks,
            access,
            filters: Vec::new(),
            url_prefix: config.url_prefix.clone(),
            allow_offline_publish: config.publish.allow_offline,
        })
    }

    /// Register a manifest filter. Filters run in registration order.
    pub fn with_filter(mut self, filter: Arc<dyn ManifestFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub(crate) fn storage(&self) -> &Arc<dyn PackageStorage> {
        &self.storage
    }

    pub(crate) fn access(&self) -> &PackageAccess {
        &self.access
    }

    pub(crate) fn filters(&self) -> &[Arc<dyn ManifestFilter>] {
        &self.filters
    }

    pub(crate) fn uplink_by_name(&self, upname: &str) -> Option<Arc<Uplink>> {
        self.uplinks
            .iter()
            .find(|u| u.upname() == upname)
            .cloned()
    }

    /// Fetch a package manifest, merged with every responsible uplink,
    /// with tarball URLs rewritten to this host. With `options.version`
    /// set, resolves a single version (dist-tags included).
    #[instrument(skip(self, options), fields(package = %name))]
    pub async fn get_package(
        &self,
        name: &PackageName,
        options: GetPackageOptions,
    ) -> RegistryResult<PackageResponse> {
        let local = match self.storage.read_package(name).await {
            Ok(manifest) => Some(manifest),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let sync_options = SyncOptions {
            uplinks_look: options.uplinks_look,
            remote_address: options.remote_address.clone(),
        };
        let outcome = self.sync_with_uplinks(name, local, &sync_options).await?;
        log_issues(name, &outcome.issues);

        let mut manifest = outcome.manifest;
        self.rewrite_tarball_urls(&mut manifest);

        match options.version {
            None => Ok(PackageResponse::Manifest(manifest)),
            Some(spec) => match manifest.resolve_version(&spec) {
                Some((_, version)) => Ok(PackageResponse::Version(version.clone())),
                None => Err(RegistryError::Core(pantry_core::Error::VersionNotFound(
                    format!("{name}@{spec}"),
                ))),
            },
        }
    }

    /// Stream a tarball, falling back to the upstream locator on a local
    /// miss (see the pipeline module).
    pub async fn get_tarball(
        &self,
        name: &PackageName,
        filename: &str,
        options: TarballOptions,
    ) -> RegistryResult<TarballStream> {
        self.stream_tarball(name, filename, options).await
    }

    /// Publish a new package. The publish-gate consults every responsible
    /// uplink first: an upstream copy of the name is a conflict; timeouts
    /// are tolerated only with offline publishing enabled.
    #[instrument(skip(self, manifest), fields(package = %name))]
    pub async fn add_package(
        &self,
        name: &PackageName,
        mut manifest: Manifest,
    ) -> RegistryResult<Manifest> {
        if manifest.name != name.to_string() {
            return Err(RegistryError::Core(pantry_core::Error::Validation(format!(
                "manifest name {:?} does not match {name}",
                manifest.name
            ))));
        }

        self.check_publish_gate(name).await?;

        if manifest.time.is_empty() {
            let stamp = now_rfc3339();
            manifest.time.insert("created".to_string(), stamp.clone());
            manifest.time.insert("modified".to_string(), stamp);
        }
        manifest.bump_rev();

        self.storage.create_package(name, &manifest).await?;
        self.storage.register_local(name).await?;
        Ok(manifest)
    }

    /// Add one version to an existing package.
    #[instrument(skip(self, record), fields(package = %name, version))]
    pub async fn add_version(
        &self,
        name: &PackageName,
        version: &str,
        record: Version,
        tag: Option<String>,
    ) -> RegistryResult<Manifest> {
        let version = version.to_string();
        let tag = tag.unwrap_or_else(|| pantry_core::TAG_LATEST.to_string());
        let url_prefix = self.url_prefix.clone();

        let manifest = self
            .storage
            .update_package(
                name,
                Box::new(move |mut manifest| {
                    if manifest.versions.contains_key(&version) {
                        return Err(pantry_core::Error::Conflict(format!(
                            "version {version} already present"
                        )));
                    }
                    if let Some(url) = record.dist.tarball.as_deref() {
                        if !is_local_url(&url_prefix, url) {
                            manifest.record_dist_file(&record);
                        }
                    }
                    manifest.versions.insert(version.clone(), record);
                    manifest.touch_time(&version);
                    manifest.dist_tags.insert(tag, version.clone());
                    manifest.normalize_dist_tags();
                    manifest.bump_rev();
                    Ok(manifest)
                }),
            )
            .await?;
        Ok(manifest)
    }

    /// Replace mutable package state from a client-supplied document:
    /// versions absent from it are unpublished, dist-tags and the star
    /// set are adopted. The incoming revision must match.
    #[instrument(skip(self, incoming), fields(package = %name))]
    pub async fn change_package(
        &self,
        name: &PackageName,
        incoming: Manifest,
    ) -> RegistryResult<Manifest> {
        if incoming.name != name.to_string() {
            return Err(RegistryError::Core(pantry_core::Error::Validation(format!(
                "manifest name {:?} does not match {name}",
                incoming.name
            ))));
        }

        let manifest = self
            .storage
            .update_package(
                name,
                Box::new(move |mut manifest| {
                    if !incoming.rev.is_empty() && incoming.rev != manifest.rev {
                        return Err(pantry_core::Error::Conflict(format!(
                            "revision mismatch: have {}, got {}",
                            manifest.rev, incoming.rev
                        )));
                    }

                    let removed: Vec<String> = manifest
                        .versions
                        .keys()
                        .filter(|v| !incoming.versions.contains_key(*v))
                        .cloned()
                        .collect();
                    for version in &removed {
                        manifest.versions.remove(version);
                        manifest.time.remove(version);
                    }

                    manifest.dist_tags = incoming.dist_tags;
                    manifest.users = incoming.users;
                    manifest.normalize_dist_tags();
                    manifest.bump_rev();
                    Ok(manifest)
                }),
            )
            .await?;
        Ok(manifest)
    }

    /// Drop a tarball and its locator after its version is unpublished.
    #[instrument(skip(self), fields(package = %name, filename))]
    pub async fn remove_tarball(&self, name: &PackageName, filename: &str) -> RegistryResult<()> {
        let filename = sanitize_filename(filename)?;
        let entry = filename.clone();

        self.storage
            .update_package(
                name,
                Box::new(move |mut manifest| {
                    manifest.dist_files.remove(&entry);
                    manifest.attachments.remove(&entry);
                    manifest.bump_rev();
                    Ok(manifest)
                }),
            )
            .await?;

        match self.storage.delete_tarball(name, &filename).await {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a package and everything it owns.
    #[instrument(skip(self), fields(package = %name))]
    pub async fn remove_package(&self, name: &PackageName) -> RegistryResult<()> {
        self.storage.remove_package(name).await?;
        self.storage.unregister_local(name).await?;
        Ok(())
    }

    /// Enumerate locally published packages with their latest version
    /// record. Per-package failures are logged, never propagated.
    pub async fn get_local_database(&self) -> RegistryResult<Vec<(PackageName, Option<Version>)>> {
        let names = self.storage.list_local().await?;
        let mut entries = Vec::with_capacity(names.len());

        for name in names {
            match self.storage.read_package(&name).await {
                Ok(mut manifest) => {
                    self.rewrite_tarball_urls(&mut manifest);
                    let latest = manifest
                        .dist_tags
                        .get(pantry_core::TAG_LATEST)
                        .and_then(|v| manifest.versions.get(v))
                        .cloned();
                    entries.push((name, latest));
                }
                Err(e) => {
                    warn!(package = %name, error = %e, "skipping unreadable local package");
                }
            }
        }

        Ok(entries)
    }

    /// The publish-gate of `add_package`.
    async fn check_publish_gate(&self, name: &PackageName) -> RegistryResult<()> {
        let uplinks = self.uplinks_for(name);
        if uplinks.is_empty() {
            return Ok(());
        }

        let checks = join_all(uplinks.iter().map(|uplink| {
            let options = FetchOptions::default();
            async move { uplink.get_remote_metadata(name, &options).await }
        }))
        .await;

        for (uplink, result) in uplinks.iter().zip(checks) {
            match result {
                Ok(_) => {
                    return Err(RegistryError::conflict(format!(
                        "{name} already exists on uplink {}",
                        uplink.upname()
                    )));
                }
                Err(e) if e.remote_status() == Some(404) => {}
                Err(e) if e.is_timeout_class() => {
                    if !self.allow_offline_publish {
                        return Err(RegistryError::service_unavailable(format!(
                            "uplink {} unreachable checking {name}: {e}",
                            uplink.upname()
                        )));
                    }
                }
                Err(e) => {
                    return Err(RegistryError::conflict(format!(
                        "uplink {} could not rule out {name}: {e}",
                        uplink.upname()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rewrite every `dist.tarball` to be served by this host. The
    /// `_distfiles` locators keep the original upstream URLs.
    pub(crate) fn rewrite_tarball_urls(&self, manifest: &mut Manifest) {
        let name = manifest.name.clone();
        let prefix = self.url_prefix.trim_end_matches('/');
        for version in manifest.versions.values_mut() {
            if let Some(url) = version.dist.tarball.as_deref() {
                if let Some(filename) = filename_from_url(url) {
                    version.dist.tarball = Some(format!("{prefix}/{name}/-/{filename}"));
                }
            }
        }
    }
}

/// Whether a tarball URL already points at this registry.
fn is_local_url(url_prefix: &str, url: &str) -> bool {
    let prefix = url_prefix.trim_end_matches('/');
    if !prefix.is_empty() && url.starts_with(prefix) {
        return true;
    }
    url.starts_with('/')
}

fn log_issues(name: &PackageName, issues: &[SyncIssue]) {
    for issue in issues {
        match issue {
            SyncIssue::Uplink { upname, error } => {
                warn!(package = %name, uplink = %upname, error = %error, "uplink issue during sync");
            }
            SyncIssue::Filter(error) => {
                warn!(package = %name, error = %error, "filter issue during sync");
            }
        }
    }
}
