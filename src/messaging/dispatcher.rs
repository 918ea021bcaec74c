use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::common::{EnvelopeKind, MessageEnvelope, PeerId};
use crate::error::{ChatError, StorageError};
use crate::network::{ConnectionManager, PeerDirectory};
use crate::storage::{MessageRecord, MessageStore, PendingRecord};

const DEFAULT_LISTENER_CAPACITY: usize = 100;

/// Chat-level send/receive: builds envelopes, hands them to the connection
/// manager, keeps undeliverable ones as pending, and tracks acknowledgments.
pub struct MessageDispatcher {
    local_id: PeerId,
    connections: Arc<ConnectionManager>,
    directory: Arc<PeerDirectory>,
    store: Arc<dyn MessageStore>,
    listeners: Mutex<Vec<mpsc::Sender<MessageEnvelope>>>,
    listener_capacity: usize,
    last_id_millis: AtomicI64,
    flushing: Mutex<HashSet<PeerId>>,
    in_flight: Mutex<HashSet<String>>,
}

impl MessageDispatcher {
    pub fn new(
        connections: Arc<ConnectionManager>,
        directory: Arc<PeerDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            local_id: connections.local_peer_id().clone(),
            connections,
            directory,
            store,
            listeners: Mutex::new(Vec::new()),
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
            last_id_millis: AtomicI64::new(0),
            flushing: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_listener_capacity(mut self, capacity: usize) -> Self {
        self.listener_capacity = capacity.max(1);
        self
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Registers a listener. It receives every newly accepted inbound chat,
    /// after it has been stored and acknowledged. A listener that falls
    /// `capacity` messages behind misses notifications; history still has them.
    pub fn subscribe(&self) -> mpsc::Receiver<MessageEnvelope> {
        let (tx, rx) = mpsc::channel(self.listener_capacity);
        self.listeners.lock().push(tx);
        rx
    }

    /// `{local_id}-{millis}`, with `millis` strictly increasing per dispatcher.
    fn next_message_id(&self) -> (String, i64) {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_id_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let millis = now.max(previous + 1);
        (format!("{}-{millis}", self.local_id), millis)
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&dyn MessageStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Returns whether a live connection to `peer_id` exists, dialing the
    /// directory address if necessary.
    async fn ensure_connected(&self, peer_id: &PeerId) -> bool {
        if self.connections.is_connected(peer_id) {
            return true;
        }

        let Some(address) = self.directory.lookup(peer_id) else {
            log::debug!("No known address for {peer_id}");
            return false;
        };

        match self.connections.connect(peer_id, &address).await {
            Ok(()) => true,
            Err(err) => {
                log::info!("Could not reach {peer_id} at {address}: {err}");
                false
            }
        }
    }

    /// Sends `content` to `recipient_id`.
    ///
    /// `Ok(true)` means the transport accepted the message; `Ok(false)` means
    /// it was stored as pending for a later [`flush_pending`](Self::flush_pending).
    /// `Err` when persistence failed, or when `content` cannot fit in a frame
    /// (nothing is stored then).
    pub async fn send_message(&self, recipient_id: &PeerId, content: &str) -> Result<bool, ChatError> {
        let (message_id, timestamp) = self.next_message_id();
        let envelope = MessageEnvelope::chat(
            message_id.clone(),
            self.local_id.clone(),
            recipient_id.clone(),
            content.to_string(),
            timestamp,
        );
        self.connections.check_frame_size(&envelope)?;

        // Keeps a flush triggered by our own dial from sending it a second time.
        let _claim = Claim::acquire(&self.in_flight, &message_id);

        // Recorded as pending before it touches the network, so a crash or an
        // early acknowledgment never finds the message missing.
        let record = MessageRecord::from_envelope(&envelope, false, false);
        let pending = PendingRecord::from_envelope(&envelope);
        self.with_store(move |store| {
            store.upsert_message(&record)?;
            store.upsert_pending(&pending)
        })
        .await?;

        let sent = self.ensure_connected(recipient_id).await
            && self.connections.send(recipient_id, &envelope).await;

        if sent {
            self.with_store(move |store| store.complete_pending(&message_id))
                .await?;
            log::info!("Message {} sent to {recipient_id}", envelope.message_id);
        } else {
            log::info!(
                "Failed to send message to {recipient_id}, stored {} as pending",
                envelope.message_id
            );
        }

        Ok(sent)
    }

    /// Retries every pending message for `peer_id`, oldest first, stopping at
    /// the first failed send. Returns how many were handed to the transport.
    ///
    /// Messages a concurrent `send_message` is still delivering are left to it,
    /// and messages too large for a frame stay pending without blocking the rest.
    pub async fn flush_pending(&self, peer_id: &PeerId) -> Result<usize, ChatError> {
        let Some(_guard) = Claim::acquire(&self.flushing, peer_id) else {
            log::debug!("Flush for {peer_id} already running");
            return Ok(0);
        };

        let recipient = peer_id.clone();
        let pending = self
            .with_store(move |store| store.pending_for(&recipient))
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        if !self.ensure_connected(peer_id).await {
            log::info!(
                "{} pending message(s) for {peer_id} kept; peer unreachable",
                pending.len()
            );
            return Ok(0);
        }

        let mut flushed = 0;
        for record in pending {
            let Some(_claim) = Claim::acquire(&self.in_flight, &record.message_id) else {
                continue;
            };
            // The snapshot may predate a send that finished since.
            let message_id = record.message_id.clone();
            let current = self
                .with_store(move |store| store.get_message(&message_id))
                .await?;
            if current.is_some_and(|stored| stored.sent) {
                continue;
            }
            let envelope = record.to_envelope();
            if let Err(err) = self.connections.check_frame_size(&envelope) {
                log::warn!("Skipping pending {} for {peer_id}: {err}", record.message_id);
                continue;
            }
            if !self.connections.send(peer_id, &envelope).await {
                log::info!("Retry of {} to {peer_id} failed; will retry later", record.message_id);
                break;
            }
            let message_id = record.message_id.clone();
            self.with_store(move |store| store.complete_pending(&message_id))
                .await?;
            flushed += 1;
        }

        log::info!("Flushed {flushed} pending message(s) to {peer_id}");
        Ok(flushed)
    }

    /// Handles an envelope that arrived on the connection from `sender_id`.
    pub async fn on_incoming(
        &self,
        sender_id: &PeerId,
        envelope: MessageEnvelope,
    ) -> Result<(), ChatError> {
        match envelope.kind {
            EnvelopeKind::Chat => self.accept_chat(sender_id, envelope).await,
            EnvelopeKind::DeliveryAck => self.accept_ack(sender_id, envelope).await,
        }
    }

    async fn accept_chat(&self, sender_id: &PeerId, envelope: MessageEnvelope) -> Result<(), ChatError> {
        if envelope.recipient_id != self.local_id {
            log::warn!(
                "Discarding chat {} from {sender_id} addressed to {}",
                envelope.message_id,
                envelope.recipient_id
            );
            return Ok(());
        }
        if &envelope.sender_id != sender_id {
            log::warn!(
                "Chat {} names sender {} but arrived from {sender_id}",
                envelope.message_id,
                envelope.sender_id
            );
        }

        let record = MessageRecord::from_envelope(&envelope, true, true);
        let inserted = self
            .with_store(move |store| store.upsert_message(&record))
            .await?;

        // Acknowledge duplicates too: the first ack may have been lost.
        let ack = MessageEnvelope::delivery_ack(&envelope, &self.local_id);
        if !self.connections.send(sender_id, &ack).await {
            log::warn!("Could not acknowledge {} to {sender_id}", envelope.message_id);
        }

        if inserted {
            log::info!("Message {} received from {sender_id}", envelope.message_id);
            self.notify(&envelope);
        } else {
            log::debug!("Duplicate message {} from {sender_id}", envelope.message_id);
        }
        Ok(())
    }

    async fn accept_ack(&self, sender_id: &PeerId, envelope: MessageEnvelope) -> Result<(), ChatError> {
        let message_id = envelope.message_id.clone();
        let known = self
            .with_store(move |store| store.mark_delivered(&message_id))
            .await?;

        if known {
            log::info!("Message {} delivered to {sender_id}", envelope.message_id);
        } else {
            log::warn!(
                "Ignoring acknowledgment for unknown message {} from {sender_id}",
                envelope.message_id
            );
        }
        Ok(())
    }

    /// Never waits on a listener: a slow one must not hold up delivery.
    fn notify(&self, envelope: &MessageEnvelope) {
        self.listeners.lock().retain(|listener| {
            match listener.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Message listener is full; it misses {}",
                        envelope.message_id
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Dropping closed message listener");
                    false
                }
            }
        });
    }

    /// History with `peer_id`, newest first, at most `limit` records.
    pub async fn get_conversation(
        &self,
        peer_id: &PeerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        let local_id = self.local_id.clone();
        let peer_id = peer_id.clone();
        let records = self
            .with_store(move |store| store.conversation(&local_id, &peer_id, limit))
            .await?;
        Ok(records)
    }
}

/// Holds `key` in a claim set for as long as it lives.
struct Claim<'a, K: Eq + Hash + Clone> {
    set: &'a Mutex<HashSet<K>>,
    key: K,
}

impl<'a, K: Eq + Hash + Clone> Claim<'a, K> {
    /// `None` if someone else already holds `key`.
    fn acquire(set: &'a Mutex<HashSet<K>>, key: &K) -> Option<Self> {
        if !set.lock().insert(key.clone()) {
            return None;
        }
        Some(Self {
            set,
            key: key.clone(),
        })
    }
}

impl<K: Eq + Hash + Clone> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}
