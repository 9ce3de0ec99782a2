//! Overlay link abstraction.
//!
//! A [`Link`] is one underlying connection to a remote peer, identified by
//! a session id. Logical streams are opened over it per protocol. The
//! overlay implementation (QUIC, TCP+yamux, in-memory) is a collaborator.
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{PeerId, SessionId, TransportError};

/// Any duplex byte stream the pool can frame.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Boxed duplex stream.
pub type BoxedIo = Box<dyn StreamIo>;

/// One underlying connection to a remote peer.
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    /// The peer at the other end.
    fn remote(&self) -> &PeerId;

    /// Session id of this connection (same value on both ends).
    fn session(&self) -> &SessionId;

    /// Whether the connection has been torn down.
    fn is_closed(&self) -> bool;

    /// Open a new logical stream for `protocol`.
    async fn open_stream(&self, protocol: &str) -> Result<BoxedIo, TransportError>;

    /// Tear the connection down.
    fn close(&self);
}

/// Opens new links to peers.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn Link>, TransportError>;
}

/// A stream opened by a remote peer towards us.
pub struct IncomingStream {
    /// Who opened it.
    pub remote: PeerId,
    /// Protocol the remote asked for.
    pub protocol: String,
    /// Our end of the link the stream travels on.
    pub link: Arc<dyn Link>,
    /// The stream itself.
    pub io: BoxedIo,
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .field("session", self.link.session())
            .finish()
    }
}

/// Transport-level notifications about links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The underlying connection to `remote` on `session` went away.
    Disconnected { remote: PeerId, session: SessionId },
}
