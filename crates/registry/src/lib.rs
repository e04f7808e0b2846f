//! The pantry registry core: merge engine, tarball pipeline, and the
//! storage facade exposed to the routing layer.
//!
//! The facade coordinates three collaborators, all injected at
//! construction: a [`pantry_storage::PackageStorage`] plugin, the
//! immutable uplink table from [`pantry_uplink::from_config`], and the
//! registry configuration.

pub mod error;
pub mod facade;
pub mod filters;
pub mod merge;
pub mod tarball;

pub use error::{RegistryError, RegistryResult};
pub use facade::{GetPackageOptions, PackageResponse, Registry};
pub use filters::{FilterError, ManifestFilter, VersionOrigins};
pub use merge::{SyncIssue, SyncOptions, SyncOutcome};
pub use tarball::{TarballByteStream, TarballOptions, TarballStream};
