//! Upstream registry proxying for pantry.
//!
//! One [`Uplink`] per configured upstream: conditional manifest fetches
//! with ETag revalidation, streaming tarball downloads, and the
//! timeout-class error taxonomy the publish-gate depends on.

pub mod error;
pub mod proxy;

pub use error::{NetworkErrorCode, UplinkError, UplinkResult};
pub use proxy::{
    FetchOptions, RemoteByteStream, RemoteTarball, Uplink, ADHOC_UPNAME,
};

use pantry_core::RegistryConfig;
use std::sync::Arc;

/// Build the uplink table from configuration, in configured order.
/// Immutable after construction; pass it to the facade by reference.
pub fn from_config(config: &RegistryConfig) -> UplinkResult<Vec<Arc<Uplink>>> {
    config
        .uplinks
        .iter()
        .map(|(upname, cfg)| Uplink::from_config(upname.clone(), cfg).map(Arc::new))
        .collect()
}
