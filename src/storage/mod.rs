pub mod client_db;
pub mod database;
pub mod models;

pub use client_db::ClientDatabase;
pub use models::{Identity, KnownPeer, MessageRecord, PendingRecord};

use crate::common::PeerId;
use crate::error::StorageError;

/// Persistence the message dispatcher relies on.
///
/// Implementations must tolerate concurrent calls; the dispatcher never
/// writes the same message id from two places at once.
pub trait MessageStore: Send + Sync {
    /// Inserts the record, or raises its `sent`/`delivered` flags if the id
    /// already exists. Returns `true` when a new row was created.
    fn upsert_message(&self, record: &MessageRecord) -> Result<bool, StorageError>;

    fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StorageError>;

    /// Returns `false` if no record with that id exists.
    fn mark_delivered(&self, message_id: &str) -> Result<bool, StorageError>;

    fn upsert_pending(&self, record: &PendingRecord) -> Result<(), StorageError>;

    /// Pending records addressed to `recipient_id`, oldest first.
    fn pending_for(&self, recipient_id: &PeerId) -> Result<Vec<PendingRecord>, StorageError>;

    /// Marks the message sent and deletes its pending record, atomically.
    fn complete_pending(&self, message_id: &str) -> Result<(), StorageError>;

    /// Messages exchanged between `local_id` and `peer_id`, newest first.
    fn conversation(
        &self,
        local_id: &PeerId,
        peer_id: &PeerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;
}
