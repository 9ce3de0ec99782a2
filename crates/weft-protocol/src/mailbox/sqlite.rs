use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use weft_transport::PeerId;

use super::store::{MailEntry, MailboxStore};
use crate::ProtocolError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mailbox (
    id         TEXT PRIMARY KEY,
    recipient  TEXT NOT NULL,
    stored_at  INTEGER NOT NULL,
    envelope   BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS mailbox_recipient ON mailbox (recipient, stored_at);
";

/// Mailbox store persisted in a SQLite database.
pub struct SqliteMailboxStore {
    conn: Mutex<Connection>,
}

impl SqliteMailboxStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, ProtocolError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ProtocolError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, Vec<u8>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn to_entry(raw: (String, String, i64, Vec<u8>)) -> Result<MailEntry, ProtocolError> {
    let (id, recipient, stored_at, envelope) = raw;
    let recipient: PeerId = recipient
        .parse()
        .map_err(|e| ProtocolError::Storage(format!("bad recipient in row {id}: {e}")))?;
    Ok(MailEntry {
        id,
        recipient,
        stored_at: stored_at.max(0) as u64,
        envelope,
    })
}

impl MailboxStore for SqliteMailboxStore {
    fn insert(&self, entry: MailEntry) -> Result<bool, ProtocolError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO mailbox (id, recipient, stored_at, envelope) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id,
                entry.recipient.to_string(),
                entry.stored_at as i64,
                entry.envelope
            ],
        )?;
        Ok(inserted == 1)
    }

    fn find(&self, recipient: &PeerId) -> Result<Vec<MailEntry>, ProtocolError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, recipient, stored_at, envelope FROM mailbox
             WHERE recipient = ?1 ORDER BY stored_at, id",
        )?;
        let rows = stmt
            .query_map(params![recipient.to_string()], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(to_entry).collect()
    }

    fn delete(&self, id: &str) -> Result<bool, ProtocolError> {
        let removed = self
            .conn()
            .execute("DELETE FROM mailbox WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn sweep(&self, older_than: u64) -> Result<usize, ProtocolError> {
        let removed = self.conn().execute(
            "DELETE FROM mailbox WHERE stored_at < ?1",
            params![older_than as i64],
        )?;
        Ok(removed)
    }

    fn recipients(&self) -> Result<Vec<PeerId>, ProtocolError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT recipient FROM mailbox ORDER BY recipient")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
            .into_iter()
            .map(|n| {
                n.parse()
                    .map_err(|e| ProtocolError::Storage(format!("bad recipient {n}: {e}")))
            })
            .collect()
    }

    fn len(&self) -> Result<usize, ProtocolError> {
        let count: Option<i64> = self
            .conn()
            .query_row("SELECT COUNT(*) FROM mailbox", [], |row| row.get(0))
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }
}
