//! Clients attached to this node in-process.
//!
//! A client is any consumer holding the receiving end of an envelope
//! channel: a websocket bridge, an embedded application, a test. Envelopes
//! whose directory record points at this node and one of these sessions
//! are handed over here without touching the network.
use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use weft_transport::{PeerId, SessionId};

use crate::{Envelope, ProtocolError};

#[derive(Clone)]
struct Attached {
    peer: PeerId,
    client_id: String,
    sink: mpsc::Sender<Envelope>,
}

#[derive(Default)]
pub struct LocalSessions {
    sessions: RwLock<HashMap<SessionId, Attached>>,
}

impl LocalSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Returns the session id to publish in the client record.
    pub async fn attach(
        &self,
        peer: PeerId,
        client_id: impl Into<String>,
        sink: mpsc::Sender<Envelope>,
    ) -> SessionId {
        let session = SessionId::random();
        let client_id = client_id.into();
        tracing::debug!("sessions: {peer}/{client_id} attached as {session}");
        self.sessions.write().await.insert(
            session.clone(),
            Attached {
                peer,
                client_id,
                sink,
            },
        );
        session
    }

    /// Remove a session. Returns the peer and client it belonged to.
    pub async fn detach(&self, session: &SessionId) -> Option<(PeerId, String)> {
        self.sessions
            .write()
            .await
            .remove(session)
            .map(|a| (a.peer, a.client_id))
    }

    /// Hand `env` to the sink of `session`.
    pub async fn deliver(&self, session: &SessionId, env: Envelope) -> Result<(), ProtocolError> {
        let sink = self
            .sessions
            .read()
            .await
            .get(session)
            .map(|a| a.sink.clone())
            .ok_or_else(|| ProtocolError::NotFound(format!("no local session {session}")))?;

        if sink.send(env).await.is_err() {
            self.sessions.write().await.remove(session);
            return Err(ProtocolError::NotFound(format!("local session {session} went away")));
        }
        Ok(())
    }

    /// Sessions attached for `peer`, optionally narrowed to one client.
    pub async fn sessions_for(&self, peer: &PeerId, client_id: Option<&str>) -> Vec<SessionId> {
        let mut found: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, a)| &a.peer == peer)
            .filter(|(_, a)| client_id.map_or(true, |c| c.is_empty() || a.client_id == c))
            .map(|(s, _)| s.clone())
            .collect();
        found.sort();
        found
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
