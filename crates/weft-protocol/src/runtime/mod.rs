//! Node runtime: wires the services together and runs their loops.
//!
//! `FabricNode::builder(identity, config)` takes the collaborators (DHT
//! overlay, link dialer, incoming streams, pub/sub, mailbox store) and
//! `start()` spawns:
//! - the accept loop (incoming streams into the pool),
//! - the dispatch loop (frames into the dispatcher, bounded concurrency),
//! - the link loop (disconnects into pool cleanup and directory marks),
//! - the activity loop (peers coming up into mailbox redelivery),
//! - the sweep timer (mailbox expiry and periodic redelivery).
//!
//! The returned [`FabricHandle`] is the application-facing API.
mod config;

pub use config::{FabricConfig, ENV_MAILBOX_RETENTION_SECS, ENV_QUERY_TIMEOUT_MS, ENV_RESPONSE_TIMEOUT_MS};

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use weft_dht::{now_ms, DirectoryStore, Overlay, Validator};
use weft_transport::memory::MemoryEndpoint;
use weft_transport::{
    ConnectionPool, Dialer, IncomingStream, InboundFrame, LinkEvent, PeerId, SessionId,
};

use crate::directory::{directory_validator, Directory, PeerClient, PeerEndpoint};
use crate::dispatcher::{Dispatcher, MessageHandler};
use crate::identity::{Identity, PeerKeys};
use crate::mailbox::{Mailbox, MailboxStore, MemoryMailboxStore};
use crate::pubsub::{MemoryPubSub, PubSub};
use crate::queue::{QueueStats, WorkQueue};
use crate::router::{DirectoryKeyResolver, RelayOutcome, Router};
use crate::security::{KeyResolver, SecurityEnvelope};
use crate::sessions::LocalSessions;
use crate::{Envelope, ProtocolError};

/// What happened to an envelope handed to [`FabricHandle::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendReceipt {
    /// The target answered. Payload already decrypted.
    Response(Envelope),
    Published,
    DeliveredLocally,
    /// Target unreachable; kept in the mailbox for redelivery.
    Queued,
    /// A response envelope left this node; nothing to wait for.
    Forwarded,
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct FabricNode;

impl FabricNode {
    pub fn builder(identity: Identity, config: FabricConfig) -> FabricNodeBuilder {
        FabricNodeBuilder {
            identity,
            config,
            overlay: None,
            validator: None,
            dialer: None,
            incoming: None,
            link_events: None,
            pubsub: None,
            mailbox_store: None,
        }
    }
}

pub struct FabricNodeBuilder {
    identity: Identity,
    config: FabricConfig,
    overlay: Option<Arc<dyn Overlay>>,
    validator: Option<Arc<dyn Validator>>,
    dialer: Option<Arc<dyn Dialer>>,
    incoming: Option<mpsc::Receiver<IncomingStream>>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    pubsub: Option<Arc<dyn PubSub>>,
    mailbox_store: Option<Arc<dyn MailboxStore>>,
}

impl FabricNodeBuilder {
    pub fn overlay(mut self, overlay: Arc<dyn Overlay>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Replace the default directory validator.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn incoming(mut self, incoming: mpsc::Receiver<IncomingStream>) -> Self {
        self.incoming = Some(incoming);
        self
    }

    pub fn link_events(mut self, events: mpsc::UnboundedReceiver<LinkEvent>) -> Self {
        self.link_events = Some(events);
        self
    }

    /// Dialer, incoming streams and link events of an in-memory endpoint.
    pub fn memory_endpoint(self, endpoint: MemoryEndpoint) -> Self {
        let (dialer, incoming, events) = endpoint.into_parts();
        self.dialer(dialer).incoming(incoming).link_events(events)
    }

    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn mailbox_store(mut self, store: Arc<dyn MailboxStore>) -> Self {
        self.mailbox_store = Some(store);
        self
    }

    /// Wire the services and spawn the node's loops. Must be called inside
    /// a Tokio runtime.
    pub fn start(self) -> Result<FabricHandle, ProtocolError> {
        let FabricNodeBuilder {
            identity,
            config,
            overlay,
            validator,
            dialer,
            incoming,
            link_events,
            pubsub,
            mailbox_store,
        } = self;
        config.validate()?;
        let overlay = overlay.ok_or_else(|| ProtocolError::Config("no overlay given".into()))?;
        let dialer = dialer.ok_or_else(|| ProtocolError::Config("no dialer given".into()))?;
        let local = identity.peer_id().clone();

        let validator = validator.unwrap_or_else(|| Arc::new(directory_validator()));
        let store = Arc::new(DirectoryStore::new(overlay, validator, config.directory.clone()));
        if store.local_peer() != &local {
            return Err(ProtocolError::Config(format!(
                "overlay runs as {} but identity is {local}",
                store.local_peer()
            )));
        }

        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let directory = Arc::new(Directory::new(store).with_activity(activity_tx));

        let (frames_tx, frames_rx) = mpsc::channel(config.transport.inbound_capacity());
        let pool = ConnectionPool::new(local.clone(), dialer, config.transport.clone(), frames_tx);

        let sessions = Arc::new(LocalSessions::new());
        let mailbox_store = mailbox_store
            .unwrap_or_else(|| Arc::new(MemoryMailboxStore::new(config.mailbox_capacity)));
        let mailbox = Arc::new(Mailbox::new(mailbox_store, config.mailbox_retention));
        let pubsub = pubsub.unwrap_or_else(|| Arc::new(MemoryPubSub::default()));
        let (queue, queue_worker) = WorkQueue::start(config.queue());

        let router = Arc::new(Router::new(
            directory.clone(),
            pool.clone(),
            sessions.clone(),
            mailbox.clone(),
            pubsub,
            queue.clone(),
        ));
        let keys: Arc<dyn KeyResolver> = Arc::new(DirectoryKeyResolver::new(directory.clone()));
        let security = Arc::new(
            SecurityEnvelope::new(identity.clone(), keys)
                .with_compress_threshold(config.compress_threshold),
        );
        let dispatcher = Arc::new(Dispatcher::new(security.clone(), router.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![queue_worker];
        if let Some(incoming) = incoming {
            tasks.push(tokio::spawn(accept_loop(pool.clone(), incoming, shutdown_rx.clone())));
        }
        tasks.push(tokio::spawn(dispatch_loop(
            dispatcher.clone(),
            frames_rx,
            config.concurrency,
            shutdown_rx.clone(),
        )));
        if let Some(events) = link_events {
            tasks.push(tokio::spawn(link_loop(
                pool.clone(),
                directory.clone(),
                events,
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(activity_loop(
            router.clone(),
            queue.clone(),
            activity_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            router.clone(),
            queue.clone(),
            config.mailbox_sweep_interval,
            shutdown_rx,
        )));

        tracing::info!("runtime: {local} started");
        Ok(FabricHandle {
            inner: Arc::new(Inner {
                identity,
                config,
                directory,
                router,
                dispatcher,
                security,
                sessions,
                pool,
                mailbox,
                queue,
                shutdown_tx,
                tasks: Mutex::new(tasks),
            }),
        })
    }
}

// ── Loops ────────────────────────────────────────────────────────────

async fn accept_loop(
    pool: Arc<ConnectionPool>,
    mut incoming: mpsc::Receiver<IncomingStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            stream = incoming.recv() => match stream {
                Some(stream) => {
                    pool.accept(stream).await;
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("runtime: accept loop stopped");
}

async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut frames: mpsc::Receiver<InboundFrame>,
    concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(concurrency.max(1)));
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let Ok(permit) = slots.clone().acquire_owned().await else { break };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.handle(frame).await;
                    drop(permit);
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("runtime: dispatch loop stopped");
}

async fn link_loop(
    pool: Arc<ConnectionPool>,
    directory: Arc<Directory>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(LinkEvent::Disconnected { remote, session }) => {
                    let gone = pool.disconnect(&remote, &session).await;
                    if gone.fully {
                        directory.mark_peer_down(&remote).await;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("runtime: link loop stopped");
}

async fn activity_loop(
    router: Arc<Router>,
    queue: WorkQueue,
    mut activity: mpsc::UnboundedReceiver<PeerId>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            peer = activity.recv() => match peer {
                Some(peer) => schedule_redelivery(&router, &queue, peer),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("runtime: activity loop stopped");
}

async fn sweep_loop(
    router: Arc<Router>,
    queue: WorkQueue,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let mailbox = router.mailbox();
                if let Err(e) = mailbox.sweep(now_ms()) {
                    tracing::warn!("runtime: mailbox sweep failed: {e}");
                }
                match mailbox.pending_recipients() {
                    Ok(peers) => {
                        for peer in peers {
                            schedule_redelivery(&router, &queue, peer);
                        }
                    }
                    Err(e) => tracing::warn!("runtime: mailbox scan failed: {e}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("runtime: sweep loop stopped");
}

fn schedule_redelivery(router: &Arc<Router>, queue: &WorkQueue, peer: PeerId) {
    let router = router.clone();
    let name = format!("redeliver {peer}");
    let job = move || {
        let router = router.clone();
        let peer = peer.clone();
        async move { router.redeliver(&peer).await.map(|_| ()) }
    };
    if let Err(e) = queue.try_submit(name, job) {
        tracing::warn!("runtime: redelivery not scheduled: {e}");
    }
}

// ── Handle ───────────────────────────────────────────────────────────

struct Inner {
    identity: Identity,
    config: FabricConfig,
    directory: Arc<Directory>,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    security: Arc<SecurityEnvelope>,
    sessions: Arc<LocalSessions>,
    pool: Arc<ConnectionPool>,
    mailbox: Arc<Mailbox>,
    queue: WorkQueue,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct FabricHandle {
    inner: Arc<Inner>,
}

impl FabricHandle {
    pub fn local_peer(&self) -> &PeerId {
        self.inner.identity.peer_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Seal and send `env`.
    ///
    /// Requests that leave this node are awaited up to the configured
    /// response timeout. A response with a non-zero status comes back as
    /// [`ProtocolError::Remote`].
    pub async fn send(&self, mut env: Envelope) -> Result<SendReceipt, ProtocolError> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(ProtocolError::Shutdown);
        }
        let local = self.local_peer().clone();
        if env.src_peer_id.is_none() {
            env.src_peer_id = Some(local.clone());
        }
        if env.src_connect_peer_id.is_none() {
            env.src_connect_peer_id = Some(local);
            if env.src_address.is_empty() {
                env.src_address = self.inner.identity.address().to_string();
            }
        }
        self.inner.dispatcher.before_send(&mut env).await?;
        self.inner.security.encrypt(&mut env).await?;
        self.inner.dispatcher.first_sighting(&env);

        let uuid = env.uuid.clone();
        let waiter = (env.is_request() && !env.has_topic())
            .then(|| self.inner.dispatcher.expect_response(&uuid));

        let outcome = match self.inner.router.relay_send(env).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.inner.dispatcher.cancel_response(&uuid);
                return Err(e);
            }
        };
        match (outcome, waiter) {
            (RelayOutcome::Forwarded { .. }, Some(rx)) => self.await_response(&uuid, rx).await,
            (outcome, _) => {
                self.inner.dispatcher.cancel_response(&uuid);
                Ok(match outcome {
                    RelayOutcome::Published => SendReceipt::Published,
                    RelayOutcome::DeliveredLocally => SendReceipt::DeliveredLocally,
                    RelayOutcome::Persisted => SendReceipt::Queued,
                    RelayOutcome::Forwarded { .. } => SendReceipt::Forwarded,
                })
            }
        }
    }

    async fn await_response(
        &self,
        uuid: &str,
        rx: oneshot::Receiver<Envelope>,
    ) -> Result<SendReceipt, ProtocolError> {
        let after = self.inner.config.response_timeout;
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(response)) if response.is_error() => Err(ProtocolError::Remote {
                status: response.status_code,
                tip: response.tip,
            }),
            Ok(Ok(response)) => Ok(SendReceipt::Response(response)),
            Ok(Err(_)) => Err(ProtocolError::Shutdown),
            Err(_) => {
                self.inner.dispatcher.cancel_response(uuid);
                Err(ProtocolError::ResponseTimeout {
                    uuid: uuid.to_string(),
                    after,
                })
            }
        }
    }

    pub fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.inner.dispatcher.register_handler(message_type, handler);
    }

    /// Attach an in-process client to this node and publish where it lives.
    /// Anything waiting in the mailbox for `peer` is redelivered.
    pub async fn attach_client(
        &self,
        peer: PeerId,
        client_id: impl Into<String>,
        keys: &PeerKeys,
        sink: mpsc::Sender<Envelope>,
    ) -> Result<SessionId, ProtocolError> {
        let client_id = client_id.into();
        let session = self
            .inner
            .sessions
            .attach(peer.clone(), client_id.clone(), sink)
            .await;
        let record = PeerClient::attached(peer.clone(), client_id, self.local_peer().clone(), keys)
            .with_session(session.clone())
            .with_address(self.inner.identity.address());
        self.inner.directory.publish_client(&record).await?;
        schedule_redelivery(&self.inner.router, &self.inner.queue, peer);
        Ok(session)
    }

    /// Detach a client and mark its record down.
    pub async fn detach_client(&self, session: &SessionId) -> Result<(), ProtocolError> {
        let Some((peer, client_id)) = self.inner.sessions.detach(session).await else {
            return Err(ProtocolError::NotFound(format!("no local session {session}")));
        };
        let now = now_ms();
        let attached_here = self
            .inner
            .directory
            .local_clients(&peer, Some(&client_id))
            .into_iter()
            .filter(|r| r.client_id == client_id)
            .filter(|r| r.connect_peer_id == *self.local_peer())
            .filter(|r| r.connect_session_id.as_ref() == Some(session));
        for mut record in attached_here {
            record.mark_down(now);
            self.inner.directory.publish_client(&record).await?;
        }
        tracing::debug!("runtime: {peer}/{client_id} detached");
        Ok(())
    }

    /// Publish this node's endpoint record.
    pub async fn publish_endpoint(&self, addresses: Vec<String>) -> Result<PeerEndpoint, ProtocolError> {
        let record = PeerEndpoint::new(
            self.local_peer().clone(),
            &self.inner.identity.keys(),
            addresses,
        );
        self.inner.directory.publish_endpoint(&record).await?;
        Ok(record)
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.inner.directory
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.inner.mailbox
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Stop the loops and close every stream.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        tracing::info!("runtime: {} shutting down", self.local_peer());
        self.inner.pool.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.inner.tasks.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }
}
