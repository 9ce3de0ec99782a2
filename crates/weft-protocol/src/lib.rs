//! Weft protocol layer.
//!
//! Envelopes, end-to-end security, directory records, routing, dispatch
//! and store-and-forward on top of `weft-transport` (connection pool) and
//! `weft-dht` (directory store).
//!
//! Wire format: MessagePack (compact binary).
//! Crypto: Ed25519 signatures + X25519/XChaCha20-Poly1305 encryption.

pub mod crypto;
pub mod directory;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod mailbox;
pub mod payload;
pub mod pubsub;
pub mod queue;
pub mod reconcile;
pub mod router;
pub mod runtime;
pub mod security;
pub mod sessions;

pub use directory::{directory_validator, Directory, PeerClient, PeerEndpoint, PeerStatus};
pub use dispatcher::{Dispatcher, MessageHandler};
pub use envelope::{Envelope, EnvelopeBuilder, MessageDirection, DEFAULT_TTL};
pub use error::{ErrorKind, ProtocolError};
pub use identity::{Identity, PeerKeys};
pub use mailbox::{Mailbox, MailboxStore, MemoryMailboxStore, Redelivery, SqliteMailboxStore};
pub use payload::Payload;
pub use pubsub::{MemoryPubSub, PubSub};
pub use queue::{QueueConfig, QueueStats, WorkQueue};
pub use reconcile::Reconciler;
pub use router::{decide, DirectoryKeyResolver, Lookup, RelayOutcome, Router, RoutingAction};
pub use runtime::{FabricConfig, FabricHandle, FabricNode, FabricNodeBuilder, SendReceipt};
pub use security::{KeyResolver, SecurityEnvelope, StaticKeys};
pub use sessions::LocalSessions;
