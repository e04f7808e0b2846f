//! Configuration types shared across crates.
//!
//! Parsing config files is the host application's job; these types are the
//! deserialized shape the core consumes. An immutable [`PackageAccess`]
//! table is compiled from the rules once at startup.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One configured upstream registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Base URL of the upstream registry.
    pub url: String,
    /// Extra request headers (e.g. authorization).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request timeout budget in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Freshness window: a manifest fetched within this many milliseconds
    /// is served without revalidation.
    #[serde(default = "default_maxage_ms")]
    pub maxage_ms: u64,
    /// Whether tarballs fetched through this uplink are cached locally.
    #[serde(default = "default_cache")]
    pub cache: bool,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: BTreeMap::new(),
            timeout_ms: default_timeout_ms(),
            maxage_ms: default_maxage_ms(),
            cache: default_cache(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_maxage_ms() -> u64 {
    120_000
}

fn default_cache() -> bool {
    true
}

/// Per-package access rule: a name pattern and the uplinks allowed to
/// proxy it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageRule {
    /// Anchored regex matched against the full package name.
    pub pattern: String,
    /// Uplink names, in proxy order.
    #[serde(default)]
    pub proxy: Vec<String>,
}

/// Publish behavior.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Allow publishing while every proxy uplink is unreachable with a
    /// timeout-class error.
    #[serde(default)]
    pub allow_offline: bool,
}

/// Top-level registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Storage root for the filesystem plugin.
    pub storage: PathBuf,
    /// Prefix prepended to rewritten tarball URLs
    /// (`<url_prefix>/<package>/-/<filename>`).
    #[serde(default)]
    pub url_prefix: String,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub uplinks: BTreeMap<String, UplinkConfig>,
    #[serde(default)]
    pub packages: Vec<PackageRule>,
}

impl RegistryConfig {
    /// Validate cross-references and compile the access table.
    pub fn compile_access(&self) -> crate::Result<PackageAccess> {
        let mut rules = Vec::with_capacity(self.packages.len());
        for rule in &self.packages {
            let re = Regex::new(&format!("^(?:{})$", rule.pattern)).map_err(|e| {
                crate::Error::Validation(format!("bad package pattern {:?}: {e}", rule.pattern))
            })?;
            for uplink in &rule.proxy {
                if !self.uplinks.contains_key(uplink) {
                    return Err(crate::Error::Validation(format!(
                        "rule {:?} references unknown uplink {uplink:?}",
                        rule.pattern
                    )));
                }
            }
            rules.push((re, rule.proxy.clone()));
        }
        Ok(PackageAccess { rules })
    }
}

/// Compiled package access rules. Immutable after construction; first
/// matching rule wins.
#[derive(Debug)]
pub struct PackageAccess {
    rules: Vec<(Regex, Vec<String>)>,
}

impl PackageAccess {
    /// Uplink names with proxy access to `name`, in configured order.
    /// An unmatched name has no proxy access.
    pub fn proxies_for(&self, name: &str) -> &[String] {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, proxy)| proxy.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RegistryConfig {
        RegistryConfig {
            storage: PathBuf::from("/tmp/pantry"),
            url_prefix: String::new(),
            publish: PublishConfig::default(),
            uplinks: BTreeMap::from([("npmjs".to_string(), UplinkConfig {
                url: "https://registry.example".to_string(),
                ..Default::default()
            })]),
            packages: vec![
                PackageRule {
                    pattern: "@internal/.*".to_string(),
                    proxy: vec![],
                },
                PackageRule {
                    pattern: ".*".to_string(),
                    proxy: vec!["npmjs".to_string()],
                },
            ],
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let access = config().compile_access().unwrap();
        assert!(access.proxies_for("@internal/secret").is_empty());
        assert_eq!(access.proxies_for("lodash"), ["npmjs".to_string()]);
    }

    #[test]
    fn pattern_is_anchored() {
        let mut cfg = config();
        cfg.packages = vec![PackageRule {
            pattern: "lodash".to_string(),
            proxy: vec!["npmjs".to_string()],
        }];
        let access = cfg.compile_access().unwrap();
        assert_eq!(access.proxies_for("lodash").len(), 1);
        assert!(access.proxies_for("lodash-es").is_empty());
    }

    #[test]
    fn unknown_uplink_rejected() {
        let mut cfg = config();
        cfg.packages.push(PackageRule {
            pattern: "x".to_string(),
            proxy: vec!["ghost".to_string()],
        });
        assert!(cfg.compile_access().is_err());
    }

    #[test]
    fn defaults_deserialize() {
        let cfg: RegistryConfig =
            serde_json::from_str(r#"{"storage":"/var/pantry"}"#).unwrap();
        assert!(cfg.uplinks.is_empty());
        assert!(!cfg.publish.allow_offline);

        let up: UplinkConfig =
            serde_json::from_str(r#"{"url":"https://r.example"}"#).unwrap();
        assert_eq!(up.timeout_ms, 30_000);
        assert_eq!(up.maxage_ms, 120_000);
        assert!(up.cache);
    }
}
