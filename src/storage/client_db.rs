use std::path::Path;

use chrono::Utc;
use rusqlite::{OptionalExtension, Result as SqlResult, Row, params};

use crate::common::{PeerAddress, PeerId};
use crate::error::StorageError;

use super::MessageStore;
use super::database::Database;
use super::models::{Identity, KnownPeer, MessageRecord, PendingRecord};

const MESSAGE_COLUMNS: &str =
    "message_id, sender_id, recipient_id, content, timestamp, is_sent, is_delivered";

/// SQLite-backed store for messages, pending sends, known peers and identity.
pub struct ClientDatabase {
    db: Database,
}

impl ClientDatabase {
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let client_db = Self {
            db: Database::new(path)?,
        };
        client_db.init_schema()?;
        Ok(client_db)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let client_db = Self {
            db: Database::in_memory()?,
        };
        client_db.init_schema()?;
        Ok(client_db)
    }

    fn init_schema(&self) -> SqlResult<()> {
        let conn = self.db.connection();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_sent INTEGER NOT NULL DEFAULT 0,
                is_delivered INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_messages (
                message_id TEXT PRIMARY KEY REFERENCES messages(message_id),
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS peers (
                peer_id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                first_seen INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        // Identity table (single row)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                peer_id TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair_time
             ON messages(sender_id, recipient_id, timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_recipient
             ON pending_messages(recipient_id, timestamp)",
            [],
        )?;

        Ok(())
    }

    // ========== Peers ==========

    pub fn upsert_peer(&self, peer: &KnownPeer) -> Result<(), StorageError> {
        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO peers (peer_id, host, port, last_seen)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(peer_id) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                last_seen = excluded.last_seen",
            params![
                peer.peer_id.as_str(),
                peer.address.host,
                peer.address.port,
                peer.last_seen
            ],
        )?;
        Ok(())
    }

    /// All known peers, most recently seen first.
    pub fn list_peers(&self) -> Result<Vec<KnownPeer>, StorageError> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT peer_id, host, port, last_seen
             FROM peers
             ORDER BY last_seen DESC",
        )?;

        let peers = stmt
            .query_map([], |row| {
                Ok(KnownPeer {
                    peer_id: PeerId::from(row.get::<_, String>(0)?),
                    address: PeerAddress::new(row.get::<_, String>(1)?, row.get(2)?),
                    last_seen: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(peers)
    }

    // ========== Identity ==========

    pub fn load_identity(&self) -> Result<Option<Identity>, StorageError> {
        let conn = self.db.connection();
        let identity = conn
            .query_row(
                "SELECT peer_id, created_at FROM identity WHERE id = 1",
                [],
                |row| {
                    Ok(Identity {
                        peer_id: PeerId::from(row.get::<_, String>(0)?),
                        created_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    pub fn save_identity(&self, peer_id: &PeerId) -> Result<(), StorageError> {
        let conn = self.db.connection();
        conn.execute(
            "INSERT OR REPLACE INTO identity (id, peer_id, created_at)
             VALUES (1, ?1, COALESCE((SELECT created_at FROM identity WHERE id = 1), ?2))",
            params![peer_id.as_str(), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn message_count(&self) -> Result<usize, StorageError> {
        let conn = self.db.connection();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn message_from_row(row: &Row<'_>) -> SqlResult<MessageRecord> {
    Ok(MessageRecord {
        message_id: row.get(0)?,
        sender_id: PeerId::from(row.get::<_, String>(1)?),
        recipient_id: PeerId::from(row.get::<_, String>(2)?),
        content: row.get(3)?,
        timestamp: row.get(4)?,
        sent: row.get(5)?,
        delivered: row.get(6)?,
    })
}

impl MessageStore for ClientDatabase {
    fn upsert_message(&self, record: &MessageRecord) -> Result<bool, StorageError> {
        let mut conn = self.db.connection();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE message_id = ?1)",
            params![record.message_id],
            |row| row.get(0),
        )?;

        if exists {
            // Flags only move forward.
            tx.execute(
                "UPDATE messages
                 SET is_sent = MAX(is_sent, ?2), is_delivered = MAX(is_delivered, ?3)
                 WHERE message_id = ?1",
                params![record.message_id, record.sent, record.delivered],
            )?;
        } else {
            tx.execute(
                "INSERT INTO messages
                 (message_id, sender_id, recipient_id, content, timestamp, is_sent, is_delivered)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.message_id,
                    record.sender_id.as_str(),
                    record.recipient_id.as_str(),
                    record.content,
                    record.timestamp,
                    record.sent,
                    record.delivered
                ],
            )?;
        }

        tx.commit()?;
        Ok(!exists)
    }

    fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StorageError> {
        let conn = self.db.connection();
        let record = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
                params![message_id],
                message_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn mark_delivered(&self, message_id: &str) -> Result<bool, StorageError> {
        let conn = self.db.connection();
        let updated = conn.execute(
            "UPDATE messages SET is_delivered = 1 WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(updated > 0)
    }

    fn upsert_pending(&self, record: &PendingRecord) -> Result<(), StorageError> {
        let conn = self.db.connection();
        conn.execute(
            "INSERT OR IGNORE INTO pending_messages
             (message_id, sender_id, recipient_id, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.message_id,
                record.sender_id.as_str(),
                record.recipient_id.as_str(),
                record.content,
                record.timestamp
            ],
        )?;
        Ok(())
    }

    fn pending_for(&self, recipient_id: &PeerId) -> Result<Vec<PendingRecord>, StorageError> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT message_id, sender_id, recipient_id, content, timestamp
             FROM pending_messages
             WHERE recipient_id = ?1
             ORDER BY timestamp ASC, rowid ASC",
        )?;

        let pending = stmt
            .query_map(params![recipient_id.as_str()], |row| {
                Ok(PendingRecord {
                    message_id: row.get(0)?,
                    sender_id: PeerId::from(row.get::<_, String>(1)?),
                    recipient_id: PeerId::from(row.get::<_, String>(2)?),
                    content: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(pending)
    }

    fn complete_pending(&self, message_id: &str) -> Result<(), StorageError> {
        let mut conn = self.db.connection();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE messages SET is_sent = 1 WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.execute(
            "DELETE FROM pending_messages WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn conversation(
        &self,
        local_id: &PeerId,
        peer_id: &PeerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE (sender_id = ?1 AND recipient_id = ?2)
                OR (sender_id = ?2 AND recipient_id = ?1)
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?3"
        ))?;

        let messages = stmt
            .query_map(
                params![local_id.as_str(), peer_id.as_str(), limit as i64],
                message_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, from: &str, to: &str, timestamp: i64, sent: bool) -> MessageRecord {
        MessageRecord {
            message_id: id.into(),
            sender_id: PeerId::from(from),
            recipient_id: PeerId::from(to),
            content: format!("content of {id}"),
            timestamp,
            sent,
            delivered: false,
        }
    }

    fn pending_of(record: &MessageRecord) -> PendingRecord {
        PendingRecord {
            message_id: record.message_id.clone(),
            sender_id: record.sender_id.clone(),
            recipient_id: record.recipient_id.clone(),
            content: record.content.clone(),
            timestamp: record.timestamp,
        }
    }

    #[test]
    fn duplicate_upsert_keeps_one_row() {
        let db = ClientDatabase::in_memory().unwrap();
        let msg = record("bob-1", "bob", "alice", 1, true);

        assert!(db.upsert_message(&msg).unwrap());
        assert!(!db.upsert_message(&msg).unwrap());
        assert_eq!(db.message_count().unwrap(), 1);
    }

    #[test]
    fn flags_never_revert() {
        let db = ClientDatabase::in_memory().unwrap();
        let msg = record("alice-1", "alice", "bob", 1, true);
        db.upsert_message(&msg).unwrap();
        assert!(db.mark_delivered("alice-1").unwrap());

        db.upsert_message(&record("alice-1", "alice", "bob", 1, false))
            .unwrap();

        let stored = db.get_message("alice-1").unwrap().unwrap();
        assert!(stored.sent);
        assert!(stored.delivered);
    }

    #[test]
    fn mark_delivered_for_unknown_id_reports_false() {
        let db = ClientDatabase::in_memory().unwrap();
        assert!(!db.mark_delivered("nobody-1").unwrap());
    }

    #[test]
    fn pending_is_returned_in_creation_order_and_completed() {
        let db = ClientDatabase::in_memory().unwrap();
        let later = record("alice-20", "alice", "bob", 20, false);
        let earlier = record("alice-10", "alice", "bob", 10, false);
        let other = record("alice-15", "alice", "carol", 15, false);
        for msg in [&later, &earlier, &other] {
            db.upsert_message(msg).unwrap();
            db.upsert_pending(&pending_of(msg)).unwrap();
        }

        let pending = db.pending_for(&PeerId::from("bob")).unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.message_id.as_str()).collect();
        assert_eq!(ids, vec!["alice-10", "alice-20"]);

        db.complete_pending("alice-10").unwrap();
        let pending = db.pending_for(&PeerId::from("bob")).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(db.get_message("alice-10").unwrap().unwrap().sent);
        assert!(!db.get_message("alice-20").unwrap().unwrap().sent);
    }

    #[test]
    fn conversation_is_newest_first_and_limited() {
        let db = ClientDatabase::in_memory().unwrap();
        db.upsert_message(&record("alice-1", "alice", "bob", 1, true)).unwrap();
        db.upsert_message(&record("bob-2", "bob", "alice", 2, true)).unwrap();
        db.upsert_message(&record("alice-3", "alice", "bob", 3, true)).unwrap();
        db.upsert_message(&record("alice-4", "alice", "carol", 4, true)).unwrap();

        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let all = db.conversation(&alice, &bob, 50).unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["alice-3", "bob-2", "alice-1"]);

        let limited = db.conversation(&alice, &bob, 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].message_id, "alice-3");
    }

    #[test]
    fn peers_and_identity_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/chat.db");

        {
            let db = ClientDatabase::with_path(&path).unwrap();
            assert!(db.load_identity().unwrap().is_none());
            db.save_identity(&PeerId::from("alice")).unwrap();
            db.upsert_peer(&KnownPeer {
                peer_id: PeerId::from("bob"),
                address: PeerAddress::new("10.0.0.2", 5001),
                last_seen: 1,
            })
            .unwrap();
            db.upsert_peer(&KnownPeer {
                peer_id: PeerId::from("bob"),
                address: PeerAddress::new("10.0.0.3", 5002),
                last_seen: 2,
            })
            .unwrap();
        }

        let db = ClientDatabase::with_path(&path).unwrap();
        assert_eq!(db.load_identity().unwrap().unwrap().peer_id.as_str(), "alice");
        let peers = db.list_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, PeerAddress::new("10.0.0.3", 5002));
    }
}
