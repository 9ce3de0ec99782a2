//! Store-and-forward mailbox for recipients that cannot be reached.
//!
//! Envelopes are persisted in wire form (payload still encrypted) keyed by
//! the target peer. When that peer comes back, [`Mailbox::redeliver`] hands
//! each envelope to a delivery function and deletes it once it has left
//! this node. Redelivery for one peer never runs twice concurrently, so an
//! envelope is not relayed by two overlapping passes.
mod sqlite;
mod store;

pub use sqlite::SqliteMailboxStore;
pub use store::{entry_id, MailEntry, MailboxStore, MemoryMailboxStore, DEFAULT_MAILBOX_CAPACITY};

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_dht::now_ms;
use weft_transport::PeerId;

use crate::{Envelope, ProtocolError};

/// Outcome of one redelivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Redelivery {
    pub delivered: usize,
    pub remaining: usize,
    /// Another pass for this peer was already running.
    pub skipped: bool,
}

pub struct Mailbox {
    store: Arc<dyn MailboxStore>,
    retention: Duration,
    inflight: Mutex<HashSet<PeerId>>,
}

/// Releases the single-flight slot when a pass ends, however it ends.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashSet<PeerId>>,
    peer: PeerId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.peer);
    }
}

impl Mailbox {
    pub fn new(store: Arc<dyn MailboxStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn MailboxStore> {
        &self.store
    }

    /// Keep `env` until `recipient` can be reached.
    /// Returns `false` if the same envelope is already waiting.
    pub fn persist(&self, env: &Envelope, recipient: &PeerId) -> Result<bool, ProtocolError> {
        let entry = MailEntry::new(env, recipient.clone(), now_ms())?;
        let id = entry.id.clone();
        let stored = self.store.insert(entry)?;
        if stored {
            tracing::info!("mailbox: stored {id} for {recipient}");
        } else {
            tracing::debug!("mailbox: {id} already waiting for {recipient}");
        }
        Ok(stored)
    }

    /// Hand every envelope waiting for `peer` to `deliver`, oldest first.
    ///
    /// `deliver` returns `Ok(true)` when the envelope left this node (it is
    /// then deleted) and `Ok(false)` when the peer is still unreachable,
    /// which ends the pass with the rest kept. Errors end the pass too.
    pub async fn redeliver<F, Fut>(&self, peer: &PeerId, mut deliver: F) -> Result<Redelivery, ProtocolError>
    where
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = Result<bool, ProtocolError>>,
    {
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            if !inflight.insert(peer.clone()) {
                tracing::debug!("mailbox: redelivery to {peer} already running");
                return Ok(Redelivery {
                    skipped: true,
                    ..Default::default()
                });
            }
        }
        let _guard = InflightGuard {
            inflight: &self.inflight,
            peer: peer.clone(),
        };

        let entries = self.store.find(peer)?;
        let mut report = Redelivery {
            remaining: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            let env = match entry.decode() {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!("mailbox: dropping undecodable {}: {e}", entry.id);
                    self.store.delete(&entry.id)?;
                    report.remaining -= 1;
                    continue;
                }
            };
            if !deliver(env).await? {
                tracing::debug!("mailbox: {peer} still unreachable, {} kept", report.remaining);
                break;
            }
            self.store.delete(&entry.id)?;
            report.delivered += 1;
            report.remaining -= 1;
        }
        if report.delivered > 0 {
            tracing::info!("mailbox: redelivered {} envelope(s) to {peer}", report.delivered);
        }
        Ok(report)
    }

    /// Discard envelopes older than the retention window.
    pub fn sweep(&self, now: u64) -> Result<usize, ProtocolError> {
        let cutoff = now.saturating_sub(self.retention.as_millis() as u64);
        let removed = self.store.sweep(cutoff)?;
        if removed > 0 {
            tracing::info!("mailbox: expired {removed} envelope(s)");
        }
        Ok(removed)
    }

    pub fn pending_recipients(&self) -> Result<Vec<PeerId>, ProtocolError> {
        self.store.recipients()
    }

    pub fn pending_for(&self, peer: &PeerId) -> Result<usize, ProtocolError> {
        Ok(self.store.find(peer)?.len())
    }
}
