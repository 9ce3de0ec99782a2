//! In-process overlay: links and streams between peers in one process.
//!
//! Every joined peer gets a [`MemoryEndpoint`] with a dialer, a channel of
//! streams remote peers opened towards it, and a channel of link events.
//! Streams are `tokio::io::duplex` pairs. Tests drive failures through
//! [`MemoryNetwork::set_online`] and [`MemoryNetwork::disconnect`].
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use crate::link::{BoxedIo, Dialer, IncomingStream, Link, LinkEvent};
use crate::{PeerId, SessionId, TransportError};

const DUPLEX_BUFFER: usize = 256 * 1024;
const INCOMING_BUFFER: usize = 64;

struct NodeSlot {
    incoming_tx: mpsc::Sender<IncomingStream>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    online: bool,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, NodeSlot>,
    sessions: Vec<Arc<MemorySession>>,
}

type SharedState = Arc<Mutex<NetworkState>>;

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated overlay shared by any number of peers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: SharedState,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `peer` to the network. Re-joining replaces the old endpoint.
    pub fn join(&self, peer: PeerId) -> MemoryEndpoint {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        lock(&self.state).nodes.insert(
            peer.clone(),
            NodeSlot {
                incoming_tx,
                events_tx,
                online: true,
            },
        );
        tracing::debug!("memory: {peer} joined");

        MemoryEndpoint {
            dialer: Arc::new(MemoryDialer {
                local: peer.clone(),
                state: Arc::downgrade(&self.state),
            }),
            peer,
            incoming: incoming_rx,
            events: events_rx,
        }
    }

    /// Take `peer` off the network, dropping all its sessions.
    pub fn leave(&self, peer: &PeerId) {
        self.close_sessions(|s| s.involves(peer));
        lock(&self.state).nodes.remove(peer);
    }

    /// Toggle reachability. Going offline drops all sessions of `peer`.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        if let Some(slot) = lock(&self.state).nodes.get_mut(peer) {
            slot.online = online;
        }
        if !online {
            self.close_sessions(|s| s.involves(peer));
        }
    }

    /// Drop every session between `a` and `b`.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.close_sessions(|s| s.involves(a) && s.involves(b));
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        lock(&self.state)
            .sessions
            .iter()
            .filter(|s| !s.closed.load(Ordering::Acquire))
            .count()
    }

    fn close_sessions(&self, matches: impl Fn(&MemorySession) -> bool) {
        let mut state = lock(&self.state);
        let (doomed, kept): (Vec<_>, Vec<_>) =
            state.sessions.drain(..).partition(|s| matches(&**s));
        state.sessions = kept;

        for session in doomed {
            if session.closed.swap(true, Ordering::AcqRel) {
                continue;
            }
            for (local, remote) in [(&session.a, &session.b), (&session.b, &session.a)] {
                if let Some(slot) = state.nodes.get(local) {
                    let _ = slot.events_tx.send(LinkEvent::Disconnected {
                        remote: remote.clone(),
                        session: session.id.clone(),
                    });
                }
            }
            tracing::debug!("memory: session {} {}<->{} dropped", session.id, session.a, session.b);
        }
    }
}

/// One peer's attachment to a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    peer: PeerId,
    dialer: Arc<MemoryDialer>,
    incoming: mpsc::Receiver<IncomingStream>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl MemoryEndpoint {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        self.dialer.clone()
    }

    /// Split into dialer, incoming streams and link events.
    pub fn into_parts(
        self,
    ) -> (
        Arc<dyn Dialer>,
        mpsc::Receiver<IncomingStream>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let dialer: Arc<dyn Dialer> = self.dialer;
        (dialer, self.incoming, self.events)
    }

    /// Next stream a remote opened towards us.
    pub async fn next_incoming(&mut self) -> Option<IncomingStream> {
        self.incoming.recv().await
    }

    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }
}

struct MemoryDialer {
    local: PeerId,
    state: Weak<Mutex<NetworkState>>,
}

#[async_trait::async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, peer: &PeerId) -> Result<Arc<dyn Link>, TransportError> {
        let Some(state) = self.state.upgrade() else {
            return Err(connect_error(peer, "network is gone"));
        };
        let mut guard = lock(&state);

        let local_online = guard.nodes.get(&self.local).is_some_and(|n| n.online);
        if !local_online {
            return Err(connect_error(peer, "local peer is offline"));
        }
        match guard.nodes.get(peer) {
            Some(slot) if slot.online => {}
            Some(_) => return Err(connect_error(peer, "peer is offline")),
            None => return Err(connect_error(peer, "peer is unknown")),
        }

        let session = Arc::new(MemorySession {
            id: SessionId::random(),
            a: self.local.clone(),
            b: peer.clone(),
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        });
        guard.sessions.push(session.clone());

        Ok(Arc::new(MemoryLink {
            shared: session,
            local_is_a: true,
        }))
    }
}

fn connect_error(peer: &PeerId, reason: &'static str) -> TransportError {
    TransportError::Connect {
        peer: peer.clone(),
        source: anyhow::anyhow!(reason),
    }
}

struct MemorySession {
    id: SessionId,
    a: PeerId,
    b: PeerId,
    closed: AtomicBool,
    state: Weak<Mutex<NetworkState>>,
}

impl MemorySession {
    fn involves(&self, peer: &PeerId) -> bool {
        self.a == *peer || self.b == *peer
    }
}

/// One side of a [`MemorySession`].
struct MemoryLink {
    shared: Arc<MemorySession>,
    local_is_a: bool,
}

impl MemoryLink {
    fn local(&self) -> &PeerId {
        if self.local_is_a {
            &self.shared.a
        } else {
            &self.shared.b
        }
    }
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    fn remote(&self) -> &PeerId {
        if self.local_is_a {
            &self.shared.b
        } else {
            &self.shared.a
        }
    }

    fn session(&self) -> &SessionId {
        &self.shared.id
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    async fn open_stream(&self, protocol: &str) -> Result<BoxedIo, TransportError> {
        let remote = self.remote().clone();
        if self.is_closed() {
            return Err(TransportError::Closed { peer: remote });
        }

        let incoming_tx = {
            let Some(state) = self.shared.state.upgrade() else {
                return Err(connect_error(&remote, "network is gone"));
            };
            let guard = lock(&state);
            match guard.nodes.get(&remote) {
                Some(slot) if slot.online => slot.incoming_tx.clone(),
                _ => return Err(connect_error(&remote, "peer is unreachable")),
            }
        };

        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        let incoming = IncomingStream {
            remote: self.local().clone(),
            protocol: protocol.to_string(),
            link: Arc::new(MemoryLink {
                shared: self.shared.clone(),
                local_is_a: !self.local_is_a,
            }),
            io: Box::new(far),
        };
        incoming_tx
            .send(incoming)
            .await
            .map_err(|_| connect_error(&remote, "peer stopped accepting streams"))?;

        Ok(Box::new(near))
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
