// Manifest and registry builders shared across integration tests.

use pantry_core::{Manifest, PackageName, PackageRule, RegistryConfig, UplinkConfig, Version};
use pantry_registry::Registry;
use pantry_storage::PackageStorage;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn pkg(name: &str) -> PackageName {
    PackageName::parse(name).unwrap()
}

/// Uplink config pointing at a mock server, tuned for fast tests.
pub fn uplink_config(url: &str) -> UplinkConfig {
    UplinkConfig {
        url: url.to_string(),
        timeout_ms: 2_000,
        maxage_ms: 120_000,
        cache: true,
        headers: BTreeMap::new(),
    }
}

/// Registry config proxying every package to `uplinks`, in order.
pub fn registry_config(uplinks: Vec<(&str, UplinkConfig)>) -> RegistryConfig {
    let proxy: Vec<String> = uplinks.iter().map(|(n, _)| n.to_string()).collect();
    RegistryConfig {
        storage: std::env::temp_dir().join("pantry-tests-unused"),
        url_prefix: String::new(),
        publish: Default::default(),
        uplinks: uplinks
            .into_iter()
            .map(|(n, c)| (n.to_string(), c))
            .collect(),
        packages: vec![PackageRule {
            pattern: ".*".to_string(),
            proxy,
        }],
    }
}

/// Build a facade over an explicit storage plugin.
pub fn build_registry(config: &RegistryConfig, storage: Arc<dyn PackageStorage>) -> Registry {
    let uplinks = pantry_uplink::from_config(config).unwrap();
    Registry::new(storage, uplinks, config).unwrap()
}

/// Upstream manifest body the way an npm-style registry answers.
pub fn remote_manifest_body(name: &str, versions: &[&str], origin: &str) -> serde_json::Value {
    let mut version_map = serde_json::Map::new();
    for v in versions {
        version_map.insert(
            v.to_string(),
            serde_json::json!({
                "name": name,
                "version": v,
                "dist": {
                    "tarball": format!("{origin}/{name}/-/{name}-{v}.tgz"),
                    "shasum": format!("shasum-of-{v}")
                }
            }),
        );
    }
    let latest = versions.last().copied().unwrap_or("0.0.0");
    serde_json::json!({
        "name": name,
        "versions": version_map,
        "dist-tags": { "latest": latest },
        "time": { "modified": "2024-01-01T00:00:00Z" }
    })
}

/// A locally publishable manifest with no versions yet.
pub fn publish_manifest(name: &str) -> Manifest {
    Manifest::empty(&pkg(name))
}

/// A version record with an upstream tarball URL.
pub fn version_with_tarball(url: &str) -> Version {
    Version {
        dist: pantry_core::Dist {
            tarball: Some(url.to_string()),
            shasum: Some("abc123".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}
