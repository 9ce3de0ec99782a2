//! Next-hop selection and relaying.
//!
//! [`decide`] is the pure part: given an envelope and what the directory
//! knows about its target, it returns a [`RoutingAction`]. [`Router`] does
//! the lookup and carries the action out over local sessions, the
//! connection pool, pub/sub or the mailbox.
use std::sync::Arc;

use weft_transport::{ConnectionPool, PeerId, Pipe, SessionId};

use crate::directory::{Directory, PeerClient};
use crate::identity::PeerKeys;
use crate::mailbox::{Mailbox, Redelivery};
use crate::pubsub::PubSub;
use crate::queue::WorkQueue;
use crate::security::KeyResolver;
use crate::sessions::LocalSessions;
use crate::{Envelope, ProtocolError};

// ── Routing decisions ──────────────────────────────────────────────────

/// What the directory knows about where a target is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lookup {
    /// Freshest active client record for the target.
    pub record: Option<PeerClient>,
    /// Overlay route to use when no record helps.
    pub fallback: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingAction {
    Publish { topic: String },
    /// Target is attached to this node in-process.
    DeliverLocal { session: SessionId },
    Forward { next_hop: PeerId },
    /// Nothing reachable: keep it for later.
    Persist { recipient: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Published,
    DeliveredLocally,
    Forwarded { via: PeerId },
    Persisted,
}

/// Decide what to do with `env` at node `local`.
pub fn decide(local: &PeerId, env: &Envelope, lookup: &Lookup) -> Result<RoutingAction, ProtocolError> {
    if env.has_topic() {
        return Ok(RoutingAction::Publish {
            topic: env.topic.clone(),
        });
    }
    let target = unicast_target(local, env)?;

    if let Some(record) = lookup.record.as_ref().filter(|r| r.is_active()) {
        if &record.connect_peer_id != local {
            return Ok(RoutingAction::Forward {
                next_hop: record.connect_peer_id.clone(),
            });
        }
        if let Some(session) = &record.connect_session_id {
            return Ok(RoutingAction::DeliverLocal {
                session: session.clone(),
            });
        }
    }
    match &lookup.fallback {
        Some(next_hop) if next_hop != local => Ok(RoutingAction::Forward {
            next_hop: next_hop.clone(),
        }),
        _ => Ok(RoutingAction::Persist {
            recipient: target.clone(),
        }),
    }
}

fn unicast_target<'a>(local: &PeerId, env: &'a Envelope) -> Result<&'a PeerId, ProtocolError> {
    match &env.target_peer_id {
        None => Err(ProtocolError::Routing(format!(
            "envelope {} has neither target nor topic",
            env.uuid
        ))),
        Some(target) if target == local => Err(ProtocolError::Routing(format!(
            "envelope {} is addressed to this node",
            env.uuid
        ))),
        Some(target) => Ok(target),
    }
}

// ── Router ─────────────────────────────────────────────────────────────

pub struct Router {
    local: PeerId,
    protocol: String,
    directory: Arc<Directory>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<LocalSessions>,
    mailbox: Arc<Mailbox>,
    pubsub: Arc<dyn PubSub>,
    queue: WorkQueue,
}

impl Router {
    pub fn new(
        directory: Arc<Directory>,
        pool: Arc<ConnectionPool>,
        sessions: Arc<LocalSessions>,
        mailbox: Arc<Mailbox>,
        pubsub: Arc<dyn PubSub>,
        queue: WorkQueue,
    ) -> Self {
        Self {
            local: directory.local_peer().clone(),
            protocol: pool.config().protocol().to_string(),
            directory,
            pool,
            sessions,
            mailbox,
            pubsub,
            queue,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Where `target` is attached: local cache, then the directory at the
    /// configured fault tolerance, then the overlay's own route.
    pub async fn lookup(&self, target: &PeerId, client_id: Option<&str>) -> Lookup {
        if let Some(record) = self
            .directory
            .local_clients(target, client_id)
            .into_iter()
            .find(PeerClient::is_active)
        {
            return Lookup {
                record: Some(record),
                fallback: None,
            };
        }

        match self.directory.clients(target, client_id).await {
            Ok(records) => {
                if let Some(record) = records.into_iter().find(PeerClient::is_active) {
                    return Lookup {
                        record: Some(record),
                        fallback: None,
                    };
                }
            }
            Err(e) => tracing::debug!("router: no client record for {target}: {e}"),
        }

        let fallback = match self.directory.store().find_peer(target).await {
            // We are its relay: hand it straight to the peer.
            Ok(route) if route.connect_peer == self.local => {
                Some(route.peer).filter(|p| p != &self.local)
            }
            Ok(route) => Some(route.connect_peer),
            Err(e) => {
                tracing::debug!("router: no overlay route to {target}: {e}");
                None
            }
        };
        Lookup {
            record: None,
            fallback,
        }
    }

    /// Move `env` one step closer to its target, or keep it in the mailbox.
    pub async fn relay_send(&self, env: Envelope) -> Result<RelayOutcome, ProtocolError> {
        if env.has_topic() {
            return self.publish(env).await;
        }
        match self.route(&env).await? {
            Some(outcome) => Ok(outcome),
            None => {
                let recipient = unicast_target(&self.local, &env)?.clone();
                self.persist(&env, &recipient)?;
                Ok(RelayOutcome::Persisted)
            }
        }
    }

    /// Like [`relay_send`](Self::relay_send) but never persists. Returns
    /// whether the envelope left this node.
    pub async fn try_deliver(&self, env: Envelope) -> Result<bool, ProtocolError> {
        Ok(self.route(&env).await?.is_some())
    }

    /// Drain the mailbox of `peer`.
    pub async fn redeliver(&self, peer: &PeerId) -> Result<Redelivery, ProtocolError> {
        self.mailbox
            .redeliver(peer, |env| self.try_deliver(env))
            .await
    }

    async fn route(&self, env: &Envelope) -> Result<Option<RelayOutcome>, ProtocolError> {
        let target = unicast_target(&self.local, env)?.clone();
        let client_id = Some(env.target_client_id.as_str()).filter(|c| !c.is_empty());
        let lookup = self.lookup(&target, client_id).await;

        let mut env = env.clone();
        if let Some(record) = &lookup.record {
            env.target_connect_peer_id = Some(record.connect_peer_id.clone());
            env.target_connect_session_id = record.connect_session_id.clone();
            env.target_connect_address = record.connect_address.clone();
        }

        match decide(&self.local, &env, &lookup)? {
            RoutingAction::Publish { .. } => self.publish(env).await.map(Some),
            RoutingAction::DeliverLocal { session } => match self.sessions.deliver(&session, env).await {
                Ok(()) => Ok(Some(RelayOutcome::DeliveredLocally)),
                Err(e) => {
                    tracing::debug!("router: local session for {target} gone: {e}");
                    self.directory.note_unreachable(&target);
                    Ok(None)
                }
            },
            RoutingAction::Forward { next_hop } => {
                let address = lookup
                    .record
                    .as_ref()
                    .filter(|r| r.connect_peer_id == next_hop)
                    .map(|r| r.connect_address.clone())
                    .unwrap_or_default();
                match self.forward(env, &next_hop, address).await {
                    Ok(()) => Ok(Some(RelayOutcome::Forwarded { via: next_hop })),
                    Err(ProtocolError::Routing(reason)) => Err(ProtocolError::Routing(reason)),
                    Err(e) => {
                        tracing::warn!("router: forward to {target} via {next_hop} failed: {e}");
                        self.directory.note_unreachable(&target);
                        Ok(None)
                    }
                }
            }
            RoutingAction::Persist { recipient } => {
                self.directory.note_unreachable(&recipient);
                Ok(None)
            }
        }
    }

    async fn forward(&self, mut env: Envelope, next_hop: &PeerId, address: String) -> Result<(), ProtocolError> {
        env.connect_peer_id = Some(next_hop.clone());
        env.connect_address = address;
        env.decrement_ttl()?;
        let bytes = env.to_bytes()?;

        let pipe = self.pool.get_or_open(next_hop, &self.protocol).await?;
        if let Err(e) = pipe.send(&bytes).await {
            // The cached stream may have died under us; try once on a fresh one.
            tracing::debug!("router: stream {} to {next_hop} failed, reopening: {e}", pipe.id());
            self.pool.close_stream(&pipe).await;
            let pipe = self.pool.get_or_open(next_hop, &self.protocol).await?;
            if let Err(e) = pipe.send(&bytes).await {
                self.pool.close_stream(&pipe).await;
                return Err(e.into());
            }
        }
        tracing::debug!("router: forwarded {} to {next_hop}", env.uuid);
        Ok(())
    }

    async fn publish(&self, env: Envelope) -> Result<RelayOutcome, ProtocolError> {
        let topic = env.topic.clone();
        let bytes = env.to_bytes()?;
        let pubsub = self.pubsub.clone();
        let job_topic = topic.clone();
        self.queue
            .submit(format!("publish {topic}"), move || {
                let pubsub = pubsub.clone();
                let topic = job_topic.clone();
                let bytes = bytes.clone();
                async move { pubsub.publish(&topic, bytes).await }
            })
            .await?;
        Ok(RelayOutcome::Published)
    }

    fn persist(&self, env: &Envelope, recipient: &PeerId) -> Result<(), ProtocolError> {
        self.mailbox.persist(env, recipient)?;
        self.directory.note_unreachable(recipient);
        Ok(())
    }

    /// Write `env` back on the pipe it (or its request) arrived on.
    pub async fn reply_on(&self, pipe: &Pipe, env: &Envelope) -> Result<(), ProtocolError> {
        let bytes = env.to_bytes()?;
        if let Err(e) = pipe.send(&bytes).await {
            self.pool.close_stream(pipe).await;
            return Err(e.into());
        }
        Ok(())
    }
}

// ── Key resolution ─────────────────────────────────────────────────────

/// Public keys from the directory: the freshest client record of the
/// peer (network and local copies reconciled), else its endpoint record.
pub struct DirectoryKeyResolver {
    directory: Arc<Directory>,
}

impl DirectoryKeyResolver {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait::async_trait]
impl KeyResolver for DirectoryKeyResolver {
    async fn keys(&self, peer: &PeerId) -> Result<PeerKeys, ProtocolError> {
        // Reconciled read first: a newer network record beats a stale local copy.
        match self.directory.clients(peer, None).await {
            Ok(records) => {
                if let Some(record) = records.first() {
                    return record.peer_keys();
                }
            }
            Err(e) => tracing::debug!("router: no client keys for {peer}: {e}"),
        }
        if let Some(record) = self.directory.local_clients(peer, None).first() {
            return record.peer_keys();
        }
        match self.directory.endpoint(peer).await {
            Ok(endpoint) => endpoint.peer_keys(),
            Err(e) => Err(ProtocolError::Security(format!(
                "no public key known for {peer}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{directory_validator, PeerEndpoint};
    use crate::identity::Identity;
    use crate::mailbox::MemoryMailboxStore;
    use crate::pubsub::MemoryPubSub;
    use crate::queue::QueueConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use weft_dht::memory::MemoryDht;
    use weft_dht::{DirectoryConfig, DirectoryStore};
    use weft_transport::memory::MemoryNetwork;
    use weft_transport::{InboundFrame, TransportConfig};

    fn peer(name: &str) -> PeerId {
        name.parse().unwrap()
    }

    fn keys(byte: u8) -> PeerKeys {
        Identity::from_seed(peer("k"), [byte; 32]).keys()
    }

    fn record(target: &str, connect: &str) -> PeerClient {
        PeerClient::attached(peer(target), "", peer(connect), &keys(1))
    }

    fn to(target: &str) -> Envelope {
        Envelope::builder("chat").to(peer(target)).from(peer("a")).build()
    }

    #[test]
    fn topic_wins() {
        let env = Envelope::builder("news").topic("weather").build();
        let action = decide(&peer("a"), &env, &Lookup::default()).unwrap();
        assert_eq!(
            action,
            RoutingAction::Publish {
                topic: "weather".into()
            }
        );
    }

    #[test]
    fn empty_or_self_target_is_routing_error() {
        let env = Envelope::new("chat");
        assert!(matches!(
            decide(&peer("a"), &env, &Lookup::default()),
            Err(ProtocolError::Routing(_))
        ));
        assert!(matches!(
            decide(&peer("a"), &to("a"), &Lookup::default()),
            Err(ProtocolError::Routing(_))
        ));
    }

    #[test]
    fn active_record_elsewhere_forwards() {
        let lookup = Lookup {
            record: Some(record("b", "c")),
            fallback: Some(peer("z")),
        };
        assert_eq!(
            decide(&peer("a"), &to("b"), &lookup).unwrap(),
            RoutingAction::Forward { next_hop: peer("c") }
        );
    }

    #[test]
    fn record_here_with_session_delivers_locally() {
        let session = SessionId::from("s1");
        let lookup = Lookup {
            record: Some(record("b", "a").with_session(session.clone())),
            fallback: None,
        };
        assert_eq!(
            decide(&peer("a"), &to("b"), &lookup).unwrap(),
            RoutingAction::DeliverLocal { session }
        );
    }

    #[test]
    fn down_record_uses_fallback_or_persists() {
        let mut down = record("b", "c");
        down.mark_down(down.last_updated + 1);
        let with_fallback = Lookup {
            record: Some(down.clone()),
            fallback: Some(peer("d")),
        };
        assert_eq!(
            decide(&peer("a"), &to("b"), &with_fallback).unwrap(),
            RoutingAction::Forward { next_hop: peer("d") }
        );
        let nothing = Lookup {
            record: Some(down),
            fallback: None,
        };
        assert_eq!(
            decide(&peer("a"), &to("b"), &nothing).unwrap(),
            RoutingAction::Persist { recipient: peer("b") }
        );
    }

    #[test]
    fn fallback_to_self_persists() {
        let lookup = Lookup {
            record: None,
            fallback: Some(peer("a")),
        };
        assert_eq!(
            decide(&peer("a"), &to("b"), &lookup).unwrap(),
            RoutingAction::Persist { recipient: peer("b") }
        );
    }

    struct Harness {
        router: Router,
        sessions: Arc<LocalSessions>,
        pubsub: Arc<MemoryPubSub>,
        directory: Arc<Directory>,
        _frames: mpsc::Receiver<InboundFrame>,
    }

    fn harness(dht: &MemoryDht, net: &MemoryNetwork, name: &str) -> Harness {
        let id = peer(name);
        let store = DirectoryStore::new(
            Arc::new(dht.join(id.clone())),
            Arc::new(directory_validator()),
            DirectoryConfig::new().query_timeout(Duration::from_millis(200)),
        );
        let directory = Arc::new(Directory::new(Arc::new(store)));
        let (dialer, _incoming, _events) = net.join(id.clone()).into_parts();
        let (frames_tx, frames) = mpsc::channel(16);
        let pool = ConnectionPool::new(id, dialer, TransportConfig::new(), frames_tx);
        let sessions = Arc::new(LocalSessions::new());
        let mailbox = Arc::new(Mailbox::new(
            Arc::new(MemoryMailboxStore::default()),
            Duration::from_secs(60),
        ));
        let pubsub = Arc::new(MemoryPubSub::default());
        let (queue, _worker) = WorkQueue::start(QueueConfig::default());
        let router = Router::new(
            directory.clone(),
            pool,
            sessions.clone(),
            mailbox,
            pubsub.clone(),
            queue,
        );
        Harness {
            router,
            sessions,
            pubsub,
            directory,
            _frames: frames,
        }
    }

    #[tokio::test]
    async fn topic_envelopes_are_published() {
        let dht = MemoryDht::new(Arc::new(directory_validator()));
        let net = MemoryNetwork::new();
        let h = harness(&dht, &net, "a");
        let mut sub = h.pubsub.subscribe("weather");

        let env = Envelope::builder("news").topic("weather").payload("sun").build();
        let outcome = h.router.relay_send(env.clone()).await.unwrap();
        assert_eq!(outcome, RelayOutcome::Published);

        let bytes = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap().uuid, env.uuid);
    }

    #[tokio::test]
    async fn unknown_target_is_persisted() {
        let dht = MemoryDht::new(Arc::new(directory_validator()));
        let net = MemoryNetwork::new();
        let h = harness(&dht, &net, "a");
        dht.join(peer("x"));

        let env = to("ghost");
        assert_eq!(h.router.relay_send(env).await.unwrap(), RelayOutcome::Persisted);
        assert_eq!(h.router.mailbox().pending_for(&peer("ghost")).unwrap(), 1);

        // Still unreachable: redelivery keeps it.
        let report = h.router.redeliver(&peer("ghost")).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn client_attached_here_gets_local_delivery() {
        let dht = MemoryDht::new(Arc::new(directory_validator()));
        let net = MemoryNetwork::new();
        let h = harness(&dht, &net, "a");

        let (tx, mut rx) = mpsc::channel(4);
        let session = h.sessions.attach(peer("phone"), "app", tx).await;
        let record = PeerClient::attached(peer("phone"), "app", peer("a"), &keys(2))
            .with_session(session.clone());
        h.directory.publish_client(&record).await.unwrap();

        let env = Envelope::builder("chat")
            .to_client(peer("phone"), "app")
            .from(peer("z"))
            .build();
        assert_eq!(
            h.router.relay_send(env.clone()).await.unwrap(),
            RelayOutcome::DeliveredLocally
        );
        let got = rx.recv().await.unwrap();
        assert_eq!(got.uuid, env.uuid);
        assert_eq!(got.target_connect_peer_id, Some(peer("a")));
        assert_eq!(got.target_connect_session_id, Some(session));
    }

    #[tokio::test]
    async fn exhausted_ttl_is_not_persisted() {
        let dht = MemoryDht::new(Arc::new(directory_validator()));
        let net = MemoryNetwork::new();
        let h = harness(&dht, &net, "a");
        let _b = harness(&dht, &net, "b");

        let env = Envelope::builder("chat").to(peer("b")).ttl(0).build();
        assert!(matches!(
            h.router.relay_send(env).await,
            Err(ProtocolError::Routing(_))
        ));
        assert!(h.router.mailbox().pending_recipients().unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_prefer_client_record_over_endpoint() {
        let dht = MemoryDht::new(Arc::new(directory_validator()));
        let net = MemoryNetwork::new();
        let a = harness(&dht, &net, "a");
        let b = harness(&dht, &net, "b");

        b.directory
            .publish_endpoint(&PeerEndpoint::new(peer("b"), &keys(3), vec![]))
            .await
            .unwrap();
        let resolver = DirectoryKeyResolver::new(a.directory.clone());
        assert_eq!(resolver.keys(&peer("b")).await.unwrap(), keys(3));

        b.directory
            .publish_client(&PeerClient::attached(peer("b"), "", peer("b"), &keys(4)))
            .await
            .unwrap();
        assert_eq!(resolver.keys(&peer("b")).await.unwrap(), keys(4));

        // `a` now holds a local copy; a newer network record still wins.
        assert!(!a.directory.local_clients(&peer("b"), None).is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.directory
            .publish_client(&PeerClient::attached(peer("b"), "", peer("b"), &keys(5)))
            .await
            .unwrap();
        assert_eq!(resolver.keys(&peer("b")).await.unwrap(), keys(5));

        assert!(matches!(
            resolver.keys(&peer("nobody")).await,
            Err(ProtocolError::Security(_))
        ));
    }
}
