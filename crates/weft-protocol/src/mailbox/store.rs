use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use weft_transport::PeerId;

use crate::{Envelope, ProtocolError};

/// Default bound on entries held by [`MemoryMailboxStore`].
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10_000;

/// One envelope waiting for an unreachable recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEntry {
    /// `"{uuid}:{direction}"`, so a request and its response never collide.
    pub id: String,
    pub recipient: PeerId,
    /// Unix millis at which the envelope was persisted.
    pub stored_at: u64,
    /// Envelope in wire form, payload still encrypted.
    pub envelope: Vec<u8>,
}

impl MailEntry {
    pub fn new(env: &Envelope, recipient: PeerId, stored_at: u64) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: entry_id(env),
            recipient,
            stored_at,
            envelope: env.to_bytes()?,
        })
    }

    pub fn decode(&self) -> Result<Envelope, ProtocolError> {
        Envelope::from_bytes(&self.envelope)
    }
}

pub fn entry_id(env: &Envelope) -> String {
    let direction = if env.is_response() { "response" } else { "request" };
    format!("{}:{direction}", env.uuid)
}

/// Durable storage behind the mailbox.
pub trait MailboxStore: Send + Sync {
    /// Store an entry. Returns `false` if an entry with the same id exists.
    fn insert(&self, entry: MailEntry) -> Result<bool, ProtocolError>;

    /// Entries for `recipient`, oldest first.
    fn find(&self, recipient: &PeerId) -> Result<Vec<MailEntry>, ProtocolError>;

    /// Remove one entry. Returns whether it existed.
    fn delete(&self, id: &str) -> Result<bool, ProtocolError>;

    /// Remove entries stored before `older_than`. Returns how many.
    fn sweep(&self, older_than: u64) -> Result<usize, ProtocolError>;

    /// Recipients with at least one entry.
    fn recipients(&self) -> Result<Vec<PeerId>, ProtocolError>;

    fn len(&self) -> Result<usize, ProtocolError>;

    fn is_empty(&self) -> Result<bool, ProtocolError> {
        Ok(self.len()? == 0)
    }
}

// ── In-memory store ─────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    entries: HashMap<String, MailEntry>,
    by_recipient: HashMap<PeerId, BTreeSet<(u64, String)>>,
}

impl Inner {
    fn remove(&mut self, id: &str) -> Option<MailEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(ids) = self.by_recipient.get_mut(&entry.recipient) {
            ids.remove(&(entry.stored_at, entry.id.clone()));
            if ids.is_empty() {
                self.by_recipient.remove(&entry.recipient);
            }
        }
        Some(entry)
    }

    fn oldest(&self) -> Option<String> {
        self.entries
            .values()
            .min_by(|a, b| (a.stored_at, &a.id).cmp(&(b.stored_at, &b.id)))
            .map(|e| e.id.clone())
    }
}

/// Mailbox store kept in process memory, bounded by `capacity`.
pub struct MemoryMailboxStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for MemoryMailboxStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

impl MemoryMailboxStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }
}

impl MailboxStore for MemoryMailboxStore {
    fn insert(&self, entry: MailEntry) -> Result<bool, ProtocolError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.entries.contains_key(&entry.id) {
            return Ok(false);
        }
        if inner.entries.len() >= self.capacity {
            if let Some(evicted) = inner.oldest().and_then(|id| inner.remove(&id)) {
                tracing::warn!(
                    "mailbox: full, evicted {} for {}",
                    evicted.id,
                    evicted.recipient
                );
            }
        }
        inner
            .by_recipient
            .entry(entry.recipient.clone())
            .or_default()
            .insert((entry.stored_at, entry.id.clone()));
        inner.entries.insert(entry.id.clone(), entry);
        Ok(true)
    }

    fn find(&self, recipient: &PeerId) -> Result<Vec<MailEntry>, ProtocolError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(ids) = inner.by_recipient.get(recipient) else {
            return Ok(vec![]);
        };
        Ok(ids
            .iter()
            .filter_map(|(_, id)| inner.entries.get(id).cloned())
            .collect())
    }

    fn delete(&self, id: &str) -> Result<bool, ProtocolError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Ok(inner.remove(id).is_some())
    }

    fn sweep(&self, older_than: u64) -> Result<usize, ProtocolError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.stored_at < older_than)
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            inner.remove(id);
        }
        Ok(expired.len())
    }

    fn recipients(&self) -> Result<Vec<PeerId>, ProtocolError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut peers: Vec<PeerId> = inner.by_recipient.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }

    fn len(&self) -> Result<usize, ProtocolError> {
        Ok(self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len())
    }
}
