//! Weft directory store.
//!
//! Typed, validated get/put of directory records over a DHT overlay,
//! plus a node-local mirror used by reconciliation.
//!
//! Values travel wrapped in a [`RecordWrapper`] and are checked by a
//! per-namespace [`Validator`] before being trusted. Conflicts between
//! replicas are settled by the validator's `select`, never by arrival order.
//!
//! The DHT itself is a collaborator behind the [`Overlay`] trait.
//! [`memory::MemoryDht`] is an in-process implementation for tests.

mod config;
mod error;
mod key;
mod local;
pub mod memory;
mod overlay;
mod record;
mod store;
mod validator;

pub use config::{DirectoryConfig, FaultTolerance};
pub use error::DirectoryError;
pub use key::DirectoryKey;
pub use local::LocalEntry;
pub use overlay::{Overlay, PeerRoute};
pub use record::{Freshness, RecordWrapper};
pub use store::{sort_freshest_first, DirectoryStore, PutOutcome};
pub use validator::{FreshnessValidator, NamespacedValidator, OpaqueValidator, Validator};

/// Well-known directory namespaces.
pub mod namespace {
    /// Client attachment records.
    pub const PEER_CLIENT: &str = "peer-client";
    /// Peer endpoint records (public key, listen address).
    pub const PEER_ENDPOINT: &str = "peer-endpoint";
    /// Content-addressed blocks.
    pub const BLOCK: &str = "block";
    /// Transaction indices.
    pub const TRANSACTION: &str = "transaction";
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
