//! Pluggable manifest filters.
//!
//! Filters run serially over the merged manifest before it is returned.
//! A failing filter is recorded in the sync issue list; it never fails
//! the overall operation.

use async_trait::async_trait;
use pantry_core::Manifest;
use std::collections::BTreeMap;
use thiserror::Error;

/// Which uplink supplied each merged version.
///
/// Kept out-of-band rather than as a sentinel key inside the version
/// records, so the serialized manifest stays clean. Locally published
/// versions have no entry.
#[derive(Clone, Debug, Default)]
pub struct VersionOrigins {
    by_version: BTreeMap<String, String>,
}

impl VersionOrigins {
    pub fn record(&mut self, version: impl Into<String>, upname: impl Into<String>) {
        self.by_version.insert(version.into(), upname.into());
    }

    /// The uplink that supplied `version`, if any.
    pub fn origin(&self, version: &str) -> Option<&str> {
        self.by_version.get(version).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_version
            .iter()
            .map(|(v, u)| (v.as_str(), u.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }
}

/// Error raised by a filter, recorded per-filter.
#[derive(Debug, Error)]
#[error("filter {name}: {message}")]
pub struct FilterError {
    pub name: String,
    pub message: String,
}

impl FilterError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A transformer applied to merged manifests before they are returned.
#[async_trait]
pub trait ManifestFilter: Send + Sync {
    /// Short identifier used in the issue list.
    fn name(&self) -> &str;

    /// Mutate the manifest in place. Version origin annotations are
    /// provided for policy decisions (e.g. dropping versions from an
    /// untrusted uplink).
    async fn filter(
        &self,
        manifest: &mut Manifest,
        origins: &VersionOrigins,
    ) -> Result<(), FilterError>;
}
