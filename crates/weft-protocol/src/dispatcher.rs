//! Inbound envelope handling.
//!
//! Every frame read off a pipe lands in [`Dispatcher::handle`]. Envelopes
//! for this node are decrypted and answered by the handler registered for
//! their message type; envelopes for anyone else are relayed untouched.
//! Topic envelopes are only shown to the local handler.
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use tokio::sync::oneshot;
use weft_transport::{InboundFrame, PeerId, Pipe};

use crate::envelope::MessageDirection;
use crate::payload::Payload;
use crate::router::Router;
use crate::security::SecurityEnvelope;
use crate::{Envelope, ProtocolError};

/// Envelope ids remembered for duplicate suppression.
const DEDUP_CAPACITY: usize = 10_000;

/// Requests relayed through this node whose response path is remembered.
const RETURN_ROUTE_CAPACITY: usize = 4_096;

/// Application logic for one message type.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called on outgoing requests of this type before they are sealed.
    async fn send(&self, _env: &mut Envelope) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Answer a request addressed to this node. The returned payload goes
    /// back in the response; `None` sends an empty acknowledgement.
    async fn receive(&self, env: &Envelope) -> Result<Option<Payload>, ProtocolError>;

    /// A response nobody on this node was waiting for.
    async fn response(&self, _env: &Envelope) -> Result<(), ProtocolError> {
        Ok(())
    }
}

pub struct Dispatcher {
    local: PeerId,
    security: Arc<SecurityEnvelope>,
    router: Arc<Router>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    seen: Mutex<LruCache<(String, MessageDirection), ()>>,
    return_routes: Mutex<LruCache<String, Pipe>>,
}

impl Dispatcher {
    pub fn new(security: Arc<SecurityEnvelope>, router: Arc<Router>) -> Self {
        Self {
            local: router.local_peer().clone(),
            security,
            router,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seen: Mutex::new(LruCache::new(capacity(DEDUP_CAPACITY))),
            return_routes: Mutex::new(LruCache::new(capacity(RETURN_ROUTE_CAPACITY))),
        }
    }

    pub fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let message_type = message_type.into();
        tracing::debug!("dispatcher: handler registered for {message_type}");
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(message_type, handler);
    }

    fn handler(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(message_type)
            .cloned()
    }

    /// Run the registered handler's pre-send hook, if any.
    pub async fn before_send(&self, env: &mut Envelope) -> Result<(), ProtocolError> {
        match self.handler(&env.message_type) {
            Some(handler) => handler.send(env).await,
            None => Ok(()),
        }
    }

    /// Register interest in the response to request `uuid`.
    pub fn expect_response(&self, uuid: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(uuid.to_string(), tx);
        rx
    }

    pub fn cancel_response(&self, uuid: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(uuid);
    }

    /// Remember `env` as handled. Returns `false` if it was seen before.
    pub fn first_sighting(&self, env: &Envelope) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(env.dedup_key(), ())
            .is_none()
    }

    /// Process one inbound frame to completion.
    pub async fn handle(&self, frame: InboundFrame) {
        let InboundFrame { pipe, data } = frame;
        let mut env = match Envelope::from_bytes(&data) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("dispatcher: dropping undecodable frame from {}: {e}", pipe.remote());
                return;
            }
        };
        if !self.first_sighting(&env) {
            tracing::debug!("dispatcher: duplicate {} {:?} dropped", env.uuid, env.direction);
            return;
        }
        if env.src_connect_peer_id.is_none() {
            env.src_connect_peer_id = Some(self.local.clone());
            env.src_connect_session_id = Some(pipe.session().clone());
        }

        let for_me = match &env.target_peer_id {
            Some(target) => target == &self.local,
            None if env.has_topic() => return self.observe_topic(env).await,
            None => true,
        };
        match (for_me, env.direction) {
            (true, MessageDirection::Request) => self.answer(env, &pipe).await,
            (true, MessageDirection::Response) => self.complete(env).await,
            (false, MessageDirection::Request) => self.relay_request(env, &pipe).await,
            (false, MessageDirection::Response) => self.relay_response(env).await,
        }
    }

    /// Topic envelopes arriving on a pipe were already published upstream:
    /// the handler sees them, nothing is relayed or answered.
    async fn observe_topic(&self, mut env: Envelope) {
        let Some(handler) = self.handler(&env.message_type) else {
            tracing::debug!("dispatcher: topic {} envelope {} dropped", env.topic, env.uuid);
            return;
        };
        if let Err(e) = self.security.decrypt(&mut env).await {
            tracing::warn!("dispatcher: topic envelope {} failed to open: {e}", env.uuid);
            return;
        }
        if let Err(e) = handler.receive(&env).await {
            tracing::debug!("dispatcher: topic envelope {} rejected: {e}", env.uuid);
        }
    }

    async fn answer(&self, request: Envelope, pipe: &Pipe) {
        let mut reply = match self.serve(request.clone()).await {
            Ok(payload) => request.reply(&self.local, payload),
            Err(e) => {
                tracing::debug!("dispatcher: request {} failed: {e}", request.uuid);
                request.error_reply(&self.local, &e)
            }
        };
        if let Err(e) = self.security.encrypt(&mut reply).await {
            tracing::warn!("dispatcher: could not seal response to {}: {e}", request.uuid);
            reply = request.error_reply(&self.local, &e);
        }
        self.mark_seen(&reply);

        if let Err(e) = self.router.reply_on(pipe, &reply).await {
            tracing::debug!(
                "dispatcher: arrival pipe for {} gone, routing response: {e}",
                reply.uuid
            );
            if let Err(e) = self.router.relay_send(reply).await {
                tracing::warn!("dispatcher: response to {} lost: {e}", request.uuid);
            }
        }
    }

    async fn serve(&self, mut request: Envelope) -> Result<Option<Payload>, ProtocolError> {
        self.security.decrypt(&mut request).await?;
        let handler = self.handler(&request.message_type).ok_or_else(|| {
            ProtocolError::NotFound(format!("no handler for {}", request.message_type))
        })?;
        handler.receive(&request).await
    }

    async fn complete(&self, mut response: Envelope) {
        if let Err(e) = self.security.decrypt(&mut response).await {
            tracing::warn!("dispatcher: response {} failed to open: {e}", response.uuid);
            response.status_code = e.status_code();
            response.tip = e.tip();
        }
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&response.uuid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => match self.handler(&response.message_type) {
                Some(handler) => {
                    if let Err(e) = handler.response(&response).await {
                        tracing::warn!("dispatcher: response handler for {} failed: {e}", response.uuid);
                    }
                }
                None => tracing::debug!("dispatcher: unclaimed response {}", response.uuid),
            },
        }
    }

    async fn relay_request(&self, request: Envelope, pipe: &Pipe) {
        self.return_routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(request.uuid.clone(), pipe.clone());

        match self.router.relay_send(request.clone()).await {
            Ok(outcome) => tracing::debug!("dispatcher: relayed {}: {outcome:?}", request.uuid),
            Err(e) => {
                tracing::debug!("dispatcher: cannot relay {}: {e}", request.uuid);
                let reply = request.error_reply(&self.local, &e);
                self.mark_seen(&reply);
                if let Err(e) = self.router.reply_on(pipe, &reply).await {
                    tracing::debug!("dispatcher: error reply for {} lost: {e}", request.uuid);
                }
            }
        }
    }

    async fn relay_response(&self, response: Envelope) {
        let route = self
            .return_routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop(&response.uuid);
        if let Some(pipe) = route.filter(|p| !p.is_closed()) {
            match self.router.reply_on(&pipe, &response).await {
                Ok(()) => return,
                Err(e) => tracing::debug!(
                    "dispatcher: return path for {} broke, routing: {e}",
                    response.uuid
                ),
            }
        }
        if let Err(e) = self.router.relay_send(response.clone()).await {
            tracing::warn!("dispatcher: response {} dropped: {e}", response.uuid);
        }
    }

    fn mark_seen(&self, env: &Envelope) {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(env.dedup_key(), ());
    }
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}
