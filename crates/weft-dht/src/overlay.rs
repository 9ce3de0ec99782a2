use serde::{Deserialize, Serialize};
use weft_transport::PeerId;

use crate::{DirectoryError, DirectoryKey};

/// Where a peer can currently be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRoute {
    pub peer: PeerId,
    /// The node to hand traffic to: the peer itself, or a relay it sits behind.
    pub connect_peer: PeerId,
    pub addresses: Vec<String>,
}

impl PeerRoute {
    pub fn direct(peer: PeerId) -> Self {
        Self {
            connect_peer: peer.clone(),
            peer,
            addresses: Vec::new(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.peer == self.connect_peer
    }
}

/// The DHT overlay this store runs on.
///
/// Values handed to and returned by the overlay are encoded
/// [`RecordWrapper`](crate::RecordWrapper)s.
#[async_trait::async_trait]
pub trait Overlay: Send + Sync {
    /// Our own id in the overlay.
    fn local_peer(&self) -> &PeerId;

    /// Store a value on the nodes closest to `key`.
    async fn put_value(&self, key: &DirectoryKey, value: Vec<u8>) -> Result<(), DirectoryError>;

    /// The best value for `key` among those found.
    async fn get_value(&self, key: &DirectoryKey) -> Result<Vec<u8>, DirectoryError>;

    /// Every replica of `key` seen in one query fan-out.
    async fn search_value(&self, key: &DirectoryKey) -> Result<Vec<Vec<u8>>, DirectoryError>;

    /// Peers closest to `key` in the key space.
    async fn get_closest_peers(&self, key: &DirectoryKey) -> Result<Vec<PeerId>, DirectoryError>;

    /// Current route to `peer`.
    async fn find_peer(&self, peer: &PeerId) -> Result<PeerRoute, DirectoryError>;

    /// Join the overlay via known peers.
    async fn bootstrap(&self) -> Result<(), DirectoryError>;
}
