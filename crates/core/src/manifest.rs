//! Manifest data model and merge-adjacent helpers.
//!
//! A manifest is the JSON document describing every version of a package.
//! Reads accept any well-formed JSON; writes always use the canonical
//! tab-indented form produced by [`Manifest::to_canonical_json`]. Unknown
//! top-level and per-version fields round-trip through flattened maps.

use crate::package::{filename_from_url, PackageName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Revision string of a manifest that has never been persisted.
pub const DEFAULT_REVISION: &str = "0-0000000000000000";

/// The reserved dist-tag.
pub const TAG_LATEST: &str = "latest";

/// `dist` sub-record of a version: tarball locator plus integrity hashes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    /// Tarball URL. Absent on locally published versions until a tarball
    /// is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Dist {
    pub fn is_empty(&self) -> bool {
        self.tarball.is_none()
            && self.shasum.is_none()
            && self.integrity.is_none()
            && self.extra.is_empty()
    }
}

/// A single version record. Arbitrary metadata plus the `dist` locator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Version {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Dist::is_empty")]
    pub dist: Dist,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Version {
    /// Whether this version has a usable tarball locator.
    pub fn has_tarball(&self) -> bool {
        self.dist.tarball.is_some()
    }
}

/// `_distfiles` entry: the authoritative upstream locator for a tarball.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistFile {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

/// `_uplinks` entry: per-uplink conditional-fetch state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UplinkRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Wall-clock milliseconds of the last successful fetch (304 included).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<u64>,
}

/// The package manifest document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub versions: BTreeMap<String, Version>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub time: BTreeMap<String, String>,
    #[serde(rename = "_distfiles", default)]
    pub dist_files: BTreeMap<String, DistFile>,
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "_uplinks", default)]
    pub uplinks: BTreeMap<String, UplinkRecord>,
    #[serde(rename = "_rev", default)]
    pub rev: String,
    #[serde(default)]
    pub users: BTreeMap<String, bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    /// Fresh empty template for a package with no local state yet.
    pub fn empty(name: &PackageName) -> Self {
        Self {
            name: name.to_string(),
            rev: DEFAULT_REVISION.to_string(),
            ..Default::default()
        }
    }

    /// Parse from JSON bytes.
    pub fn from_json_slice(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Encode in the canonical on-disk form: JSON with tab indentation.
    pub fn to_canonical_json(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1024);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)
            .map_err(|e| crate::Error::Serialization(e.to_string()))?;
        out.push(b'\n');
        Ok(out)
    }

    /// Bump `_rev`: increment the integer prefix, fresh random suffix.
    pub fn bump_rev(&mut self) {
        let counter = self
            .rev
            .split('-')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.rev = format!("{}-{}", counter + 1, &suffix[..16]);
    }

    /// Resolve a version spec: exact version, then dist-tag, then best
    /// semver-range match.
    pub fn resolve_version(&self, spec: &str) -> Option<(&str, &Version)> {
        if let Some(v) = self.versions.get_key_value(spec) {
            return Some((v.0.as_str(), v.1));
        }
        if let Some(target) = self.dist_tags.get(spec) {
            if let Some(v) = self.versions.get_key_value(target) {
                return Some((v.0.as_str(), v.1));
            }
        }
        let req = semver::VersionReq::parse(spec).ok()?;
        self.versions
            .iter()
            .filter_map(|(k, v)| semver::Version::parse(k).ok().map(|sv| (sv, k, v)))
            .filter(|(sv, _, _)| req.matches(sv))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, k, v)| (k.as_str(), v))
    }

    /// Drop dist-tags whose target version is absent; if `latest` is then
    /// missing but versions exist, point it at the highest semver.
    pub fn normalize_dist_tags(&mut self) {
        let versions = &self.versions;
        self.dist_tags.retain(|_, target| versions.contains_key(target));

        if !self.dist_tags.contains_key(TAG_LATEST) {
            let highest = self
                .versions
                .keys()
                .filter_map(|k| semver::Version::parse(k).ok().map(|sv| (sv, k)))
                .max_by(|a, b| a.0.cmp(&b.0))
                .map(|(_, k)| k.clone());
            if let Some(v) = highest {
                self.dist_tags.insert(TAG_LATEST.to_string(), v);
            }
        }
    }

    /// Record the tarball of `version` in `_distfiles`, keyed by the
    /// filename embedded in its `dist.tarball` URL. The original upstream
    /// URL is retained (§6); an existing entry is left untouched.
    pub fn record_dist_file(&mut self, version: &Version) {
        let Some(url) = version.dist.tarball.as_deref() else {
            return;
        };
        let Some(filename) = filename_from_url(url) else {
            return;
        };
        self.dist_files.entry(filename).or_insert_with(|| DistFile {
            url: url.to_string(),
            sha: version.dist.shasum.clone(),
        });
    }

    /// Merge a remote manifest into this one.
    ///
    /// Local wins on version collision, except that a local version
    /// missing `dist.tarball` adopts the remote record. Remote dist-tags
    /// are taken when the local tag is absent or points at a lower semver.
    /// `time` keys take the max of both sides. When `record_dist_files`
    /// is set (uplink has caching enabled), every remote-supplied version
    /// gets a `_distfiles` entry.
    ///
    /// Returns the versions that were adopted from the remote side, for
    /// the caller's origin bookkeeping.
    pub fn merge_remote(&mut self, remote: &Manifest, record_dist_files: bool) -> Vec<String> {
        let mut adopted = Vec::new();

        for (version, record) in &remote.versions {
            let take = match self.versions.get(version) {
                None => true,
                Some(local) => !local.has_tarball(),
            };
            if take {
                self.versions.insert(version.clone(), record.clone());
                adopted.push(version.clone());
            }
            if record_dist_files {
                self.record_dist_file(record);
            }
        }

        for (tag, target) in &remote.dist_tags {
            let adopt = match self.dist_tags.get(tag) {
                None => true,
                Some(local_target) => semver_lt(local_target, target),
            };
            if adopt {
                self.dist_tags.insert(tag.clone(), target.clone());
            }
        }

        for (key, stamp) in &remote.time {
            self.time
                .entry(key.clone())
                .and_modify(|local_stamp| {
                    if time_lt(local_stamp, stamp) {
                        *local_stamp = stamp.clone();
                    }
                })
                .or_insert_with(|| stamp.clone());
        }

        adopted
    }

    /// Stamp `time[version]` and `time.modified` (creating `created` on
    /// first use) with the current instant.
    pub fn touch_time(&mut self, version: &str) {
        let stamp = now_rfc3339();
        self.time.entry("created".to_string()).or_insert_with(|| stamp.clone());
        self.time.insert("modified".to_string(), stamp.clone());
        self.time.insert(version.to_string(), stamp);
    }

    /// Zero out `_attachments` (read responses never carry payloads).
    pub fn clear_attachments(&mut self) {
        self.attachments.clear();
    }
}

fn semver_lt(a: &str, b: &str) -> bool {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

fn time_lt(a: &str, b: &str) -> bool {
    match (
        OffsetDateTime::parse(a, &Rfc3339),
        OffsetDateTime::parse(b, &Rfc3339),
    ) {
        (Ok(a), Ok(b)) => a < b,
        // Same canonical format on both sides makes string order a usable
        // fallback for stamps the time crate cannot parse.
        _ => a < b,
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as u64
}

/// Current wall-clock time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}
