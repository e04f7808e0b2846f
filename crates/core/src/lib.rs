//! Core domain types for the pantry registry proxy-cache.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Package names and filesystem sanitization
//! - Manifest structure, merge helpers, and canonical encoding
//! - Registry, uplink, and package-rule configuration
//! - The domain error taxonomy and its HTTP mapping

pub mod config;
pub mod error;
pub mod manifest;
pub mod package;

pub use config::{PackageAccess, PackageRule, PublishConfig, RegistryConfig, UplinkConfig};
pub use error::{Error, Result};
pub use manifest::{
    now_millis, now_rfc3339, Dist, DistFile, Manifest, UplinkRecord, Version, DEFAULT_REVISION,
    TAG_LATEST,
};
pub use package::{filename_from_url, sanitize_filename, PackageName};
