//! Weft transport layer.
//!
//! Owns everything that touches raw streams: peer identities, the
//! length-prefixed framing, the overlay link abstraction and the
//! [`ConnectionPool`] that multiplexes logical conversations over a
//! small number of reusable streams.
//!
//! The overlay itself (dialing, NAT traversal, relays) is a collaborator
//! behind the [`Dialer`] and [`Link`] traits. [`memory::MemoryNetwork`]
//! implements them in-process for tests and embedders.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use weft_transport::{memory::MemoryNetwork, ConnectionPool, PeerId, TransportConfig};
//!
//! # async fn example() -> Result<(), weft_transport::TransportError> {
//! let network = MemoryNetwork::new();
//! let alice: PeerId = "alice".parse()?;
//! let bob: PeerId = "bob".parse()?;
//! let alice_end = network.join(alice.clone());
//! let _bob_end = network.join(bob.clone());
//!
//! let (frames_tx, _frames_rx) = tokio::sync::mpsc::channel(64);
//! let config = TransportConfig::new();
//! let pool = ConnectionPool::new(alice, alice_end.dialer(), config.clone(), frames_tx);
//! let pipe = pool.get_or_open(&bob, config.protocol()).await?;
//! pipe.send(b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod framing;
mod link;
pub mod memory;
mod pool;

pub use config::TransportConfig;
pub use error::TransportError;
pub use framing::{read_frame, write_frame};
pub use link::{BoxedIo, Dialer, IncomingStream, Link, LinkEvent, StreamIo};
pub use pool::{ConnectionPool, Direction, Disconnected, InboundFrame, Pipe, PoolStats, StreamId};

use std::fmt;
use std::str::FromStr;

/// Overlay identity of a peer (or of a client attached to a peer).
///
/// Opaque, non-empty string. Displayed and parsed verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        };
        write!(f, "PeerId({short})")
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() != s.len() {
            return Err(TransportError::InvalidPeerId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of one underlying connection between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random session id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Default protocol identifier for relayed envelopes.
pub const WEFT_PROTOCOL: &str = "/weft/relay/1.0.0";
