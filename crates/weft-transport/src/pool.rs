//! Connection pool: reusable framed streams per peer.
//!
//! Three tables, each behind its own lock:
//! - outbound pipes keyed by `(peer, protocol)`,
//! - inbound pipes keyed by `(peer, session)`,
//! - underlying links keyed by `(peer, session)`.
//!
//! The pool is the only place raw streams are mutated. Everything else
//! holds [`Pipe`] handles, which are cheap to clone and safe to drop.
//! Every frame read from any pipe is forwarded to a single
//! [`InboundFrame`] channel, consumed by the dispatcher.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

use crate::framing::{read_frame, write_frame};
use crate::link::{BoxedIo, Dialer, IncomingStream, Link};
use crate::{PeerId, SessionId, TransportConfig, TransportError};

/// Pool-unique identifier of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Who opened a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We opened it (`get_or_open`).
    Outbound,
    /// The remote opened it (`accept`).
    Inbound,
}

/// One frame read off a pipe, plus the pipe it arrived on (for replies).
#[derive(Debug)]
pub struct InboundFrame {
    pub pipe: Pipe,
    pub data: Vec<u8>,
}

/// Result of tearing down one session to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub remote: PeerId,
    pub session: SessionId,
    /// No other live session to `remote` remains.
    pub fully: bool,
}

/// Snapshot of pool table sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub outbound: usize,
    pub inbound: usize,
    pub links: usize,
}

// ── Pipe ─────────────────────────────────────────────────────────────

/// Handle to one framed duplex stream.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    id: StreamId,
    remote: PeerId,
    session: SessionId,
    protocol: String,
    direction: Direction,
    writer: Mutex<Option<WriteHalf<BoxedIo>>>,
    closed: AtomicBool,
    reader: OnceLock<AbortHandle>,
    write_timeout: Duration,
    max_message_size: usize,
}

impl Pipe {
    fn new(
        id: StreamId,
        remote: PeerId,
        session: SessionId,
        protocol: String,
        direction: Direction,
        writer: WriteHalf<BoxedIo>,
        config: &TransportConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                id,
                remote,
                session,
                protocol,
                direction,
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                reader: OnceLock::new(),
                write_timeout: config.write_timeout,
                max_message_size: config.max_message_size,
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn remote(&self) -> &PeerId {
        &self.inner.remote
    }

    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same stream instance.
    pub fn same_stream(&self, other: &Pipe) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Write one frame, bounded by the write deadline.
    ///
    /// A failed or timed-out write leaves the stream in an unknown state,
    /// so the pipe is marked closed and the pool replaces it on next use.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.inner.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.inner.max_message_size,
            });
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(self.closed_error());
        };

        let deadline = self.inner.write_timeout;
        match tokio::time::timeout(deadline, write_frame(writer, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => {
                self.inner.closed.store(true, Ordering::Release);
                Err(TransportError::Send {
                    peer: self.inner.remote.clone(),
                    source,
                })
            }
            Err(_) => {
                self.inner.closed.store(true, Ordering::Release);
                Err(TransportError::Timeout {
                    operation: "frame write",
                    after: deadline,
                })
            }
        }
    }

    /// Close the stream: stop writing, stop the reader.
    ///
    /// Does not touch pool tables; use [`ConnectionPool::close_stream`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        // Last: may be the reader task itself closing its own pipe.
        if let Some(handle) = self.inner.reader.get() {
            handle.abort();
        }
    }

    fn closed_error(&self) -> TransportError {
        TransportError::Closed {
            peer: self.inner.remote.clone(),
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("session", &self.inner.session)
            .field("protocol", &self.inner.protocol)
            .field("direction", &self.inner.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── ConnectionPool ───────────────────────────────────────────────────

/// Caches links and framed streams per peer. First `get_or_open()`
/// triggers a dial, subsequent calls reuse the cached pipe.
pub struct ConnectionPool {
    local: PeerId,
    dialer: Arc<dyn Dialer>,
    config: TransportConfig,
    frames_tx: mpsc::Sender<InboundFrame>,
    next_stream: AtomicU64,
    outbound: Mutex<HashMap<(PeerId, String), Pipe>>,
    inbound: Mutex<HashMap<(PeerId, SessionId), Pipe>>,
    links: Mutex<HashMap<(PeerId, SessionId), Arc<dyn Link>>>,
    me: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(
        local: PeerId,
        dialer: Arc<dyn Dialer>,
        config: TransportConfig,
        frames_tx: mpsc::Sender<InboundFrame>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            local,
            dialer,
            config,
            frames_tx,
            next_stream: AtomicU64::new(0),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// The peer this pool belongs to.
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Get the cached outbound pipe for `(peer, protocol)` or open one.
    ///
    /// Opening reuses a live link to the peer when one exists (including
    /// links the peer dialed towards us), otherwise dials.
    pub async fn get_or_open(&self, peer: &PeerId, protocol: &str) -> Result<Pipe, TransportError> {
        if *peer == self.local {
            return Err(TransportError::Connect {
                peer: peer.clone(),
                source: anyhow::anyhow!("refusing to open a stream to self"),
            });
        }

        let key = (peer.clone(), protocol.to_string());
        if let Some(pipe) = self.cached_outbound(&key).await {
            return Ok(pipe);
        }

        // Dial and open without holding the table lock.
        let link = self.link_for(peer).await?;
        let after = self.config.connect_timeout;
        let io = match tokio::time::timeout(after, link.open_stream(protocol)).await {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => {
                self.forget_link(peer, link.session()).await;
                return Err(e);
            }
            Err(_) => {
                self.forget_link(peer, link.session()).await;
                return Err(TransportError::Timeout {
                    operation: "open stream",
                    after,
                });
            }
        };

        let pipe = self.register(
            io,
            link.remote().clone(),
            link.session().clone(),
            protocol,
            Direction::Outbound,
        );

        let mut outbound = self.outbound.lock().await;
        if let Some(existing) = outbound.get(&key).filter(|p| !p.is_closed()).cloned() {
            drop(outbound);
            tracing::debug!(
                "pool: stream {} to {peer} lost the race to {}, closing",
                pipe.id(),
                existing.id()
            );
            pipe.close().await;
            return Ok(existing);
        }
        tracing::debug!("pool: opened stream {} to {peer} ({protocol})", pipe.id());
        outbound.insert(key, pipe.clone());
        Ok(pipe)
    }

    /// The live cached outbound pipe for `key`; a closed one is evicted.
    async fn cached_outbound(&self, key: &(PeerId, String)) -> Option<Pipe> {
        let mut outbound = self.outbound.lock().await;
        let pipe = outbound.get(key)?.clone();
        if !pipe.is_closed() {
            return Some(pipe);
        }
        tracing::debug!("pool: replacing closed stream {} to {}", pipe.id(), key.0);
        outbound.remove(key);
        None
    }

    /// Register a stream the remote opened towards us.
    ///
    /// A newer stream on the same `(peer, session)` replaces the cached
    /// one; the older stream keeps running until it ends on its own.
    pub async fn accept(&self, incoming: IncomingStream) -> Pipe {
        let IncomingStream {
            remote,
            protocol,
            link,
            io,
        } = incoming;
        let session = link.session().clone();

        self.links
            .lock()
            .await
            .entry((remote.clone(), session.clone()))
            .or_insert_with(|| link.clone());

        let pipe = self.register(io, remote.clone(), session.clone(), &protocol, Direction::Inbound);
        tracing::debug!("pool: accepted stream {} from {remote} ({protocol})", pipe.id());
        self.inbound
            .lock()
            .await
            .insert((remote, session), pipe.clone());
        pipe
    }

    /// Close a pipe and evict it from its table.
    ///
    /// The table entry is removed only if it still holds this exact
    /// stream id: a late close for a stale stream never evicts a fresh
    /// stream registered under the same key. Returns whether an entry
    /// was evicted.
    pub async fn close_stream(&self, pipe: &Pipe) -> bool {
        let evicted = match pipe.direction() {
            Direction::Outbound => {
                let key = (pipe.remote().clone(), pipe.protocol().to_string());
                evict_if_same(&mut *self.outbound.lock().await, &key, pipe.id())
            }
            Direction::Inbound => {
                let key = (pipe.remote().clone(), pipe.session().clone());
                evict_if_same(&mut *self.inbound.lock().await, &key, pipe.id())
            }
        };
        if evicted {
            tracing::debug!("pool: closed stream {} to {}", pipe.id(), pipe.remote());
        } else {
            tracing::debug!(
                "pool: stale close for stream {} to {} ignored",
                pipe.id(),
                pipe.remote()
            );
        }
        pipe.close().await;
        evicted
    }

    /// Tear down one session to a peer: its link and every pipe on it.
    pub async fn disconnect(&self, remote: &PeerId, session: &SessionId) -> Disconnected {
        let link = self
            .links
            .lock()
            .await
            .remove(&(remote.clone(), session.clone()));
        if let Some(link) = &link {
            link.close();
        }

        let mut doomed = Vec::new();
        {
            let mut outbound = self.outbound.lock().await;
            outbound.retain(|_, pipe| {
                let hit = pipe.remote() == remote && pipe.session() == session;
                if hit {
                    doomed.push(pipe.clone());
                }
                !hit
            });
        }
        {
            let mut inbound = self.inbound.lock().await;
            inbound.retain(|_, pipe| {
                let hit = pipe.remote() == remote && pipe.session() == session;
                if hit {
                    doomed.push(pipe.clone());
                }
                !hit
            });
        }
        for pipe in &doomed {
            pipe.close().await;
        }

        let fully = !self
            .links
            .lock()
            .await
            .iter()
            .any(|((peer, _), link)| peer == remote && !link.is_closed());

        tracing::info!(
            "pool: disconnected {remote} session {session} ({} streams closed, fully={fully})",
            doomed.len()
        );

        Disconnected {
            remote: remote.clone(),
            session: session.clone(),
            fully,
        }
    }

    /// Any live pipe to `peer`: outbound first, then inbound.
    pub async fn pipe_to(&self, peer: &PeerId) -> Option<Pipe> {
        let outbound = self
            .outbound
            .lock()
            .await
            .iter()
            .find(|((p, _), pipe)| p == peer && !pipe.is_closed())
            .map(|(_, pipe)| pipe.clone());
        if outbound.is_some() {
            return outbound;
        }
        self.inbound
            .lock()
            .await
            .iter()
            .find(|((p, _), pipe)| p == peer && !pipe.is_closed())
            .map(|(_, pipe)| pipe.clone())
    }

    /// Peers with at least one live link, sorted.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let links = self.links.lock().await;
        let mut peers: Vec<PeerId> = links
            .iter()
            .filter(|(_, link)| !link.is_closed())
            .map(|((peer, _), _)| peer.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            outbound: self.outbound.lock().await.len(),
            inbound: self.inbound.lock().await.len(),
            links: self.links.lock().await.len(),
        }
    }

    /// Close everything.
    pub async fn shutdown(&self) {
        let pipes: Vec<Pipe> = {
            let mut outbound = self.outbound.lock().await;
            let mut inbound = self.inbound.lock().await;
            outbound
                .drain()
                .map(|(_, p)| p)
                .chain(inbound.drain().map(|(_, p)| p))
                .collect()
        };
        for pipe in pipes {
            pipe.close().await;
        }
        for (_, link) in self.links.lock().await.drain() {
            link.close();
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// A live link to `peer`, dialing if there is none.
    async fn link_for(&self, peer: &PeerId) -> Result<Arc<dyn Link>, TransportError> {
        {
            let mut links = self.links.lock().await;
            links.retain(|(p, _), link| p != peer || !link.is_closed());
            if let Some(link) = links
                .iter()
                .find(|((p, _), _)| p == peer)
                .map(|(_, link)| link.clone())
            {
                return Ok(link);
            }
        }

        let after = self.config.connect_timeout;
        let link = tokio::time::timeout(after, self.dialer.dial(peer))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "dial",
                after,
            })??;
        tracing::debug!("pool: dialed {peer} (session {})", link.session());
        self.links
            .lock()
            .await
            .insert((peer.clone(), link.session().clone()), link.clone());
        Ok(link)
    }

    async fn forget_link(&self, peer: &PeerId, session: &SessionId) {
        if let Some(link) = self
            .links
            .lock()
            .await
            .remove(&(peer.clone(), session.clone()))
        {
            link.close();
        }
    }

    fn register(
        &self,
        io: BoxedIo,
        remote: PeerId,
        session: SessionId,
        protocol: &str,
        direction: Direction,
    ) -> Pipe {
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed) + 1);
        let (read_half, write_half) = tokio::io::split(io);
        let pipe = Pipe::new(
            id,
            remote,
            session,
            protocol.to_string(),
            direction,
            write_half,
            &self.config,
        );

        let handle = tokio::spawn(read_loop(
            self.me.clone(),
            pipe.clone(),
            read_half,
            self.frames_tx.clone(),
            self.config.max_message_size,
            self.config.read_timeout,
        ));
        let _ = pipe.inner.reader.set(handle.abort_handle());
        pipe
    }
}

fn evict_if_same<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Pipe>,
    key: &K,
    id: StreamId,
) -> bool {
    match map.get(key) {
        Some(cached) if cached.id() == id => {
            map.remove(key);
            true
        }
        _ => false,
    }
}

/// Demultiplex every frame on a pipe to the dispatcher channel.
async fn read_loop(
    pool: Weak<ConnectionPool>,
    pipe: Pipe,
    mut reader: ReadHalf<BoxedIo>,
    frames_tx: mpsc::Sender<InboundFrame>,
    max_size: usize,
    body_timeout: Duration,
) {
    loop {
        match read_frame(&mut reader, max_size, body_timeout).await {
            Ok(Some(data)) => {
                let frame = InboundFrame {
                    pipe: pipe.clone(),
                    data,
                };
                if frames_tx.send(frame).await.is_err() {
                    tracing::debug!("pool: frame consumer gone, stopping reader {}", pipe.id());
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("pool: stream {} from {} ended", pipe.id(), pipe.remote());
                break;
            }
            Err(e) => {
                tracing::warn!("pool: read from {} failed: {e}", pipe.remote());
                break;
            }
        }
    }
    drop(reader);

    match pool.upgrade() {
        Some(pool) => {
            pool.close_stream(&pipe).await;
        }
        None => pipe.close().await,
    }
}
