use serde::{Deserialize, Serialize};

use crate::common::{MessageEnvelope, PeerAddress, PeerId};

/// Durable copy of a chat message; doubles as conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub sender_id: PeerId,
    pub recipient_id: PeerId,
    pub content: String,
    pub timestamp: i64,
    /// Handed to the transport successfully at least once.
    pub sent: bool,
    /// Acknowledged by the recipient (or received, for our copy of inbound chats).
    pub delivered: bool,
}

impl MessageRecord {
    pub fn from_envelope(envelope: &MessageEnvelope, sent: bool, delivered: bool) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            sender_id: envelope.sender_id.clone(),
            recipient_id: envelope.recipient_id.clone(),
            content: envelope.content.clone(),
            timestamp: envelope.timestamp,
            sent,
            delivered,
        }
    }
}

/// A chat message still waiting for a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub message_id: String,
    pub sender_id: PeerId,
    pub recipient_id: PeerId,
    pub content: String,
    pub timestamp: i64,
}

impl PendingRecord {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            sender_id: envelope.sender_id.clone(),
            recipient_id: envelope.recipient_id.clone(),
            content: envelope.content.clone(),
            timestamp: envelope.timestamp,
        }
    }

    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope::chat(
            self.message_id.clone(),
            self.sender_id.clone(),
            self.recipient_id.clone(),
            self.content.clone(),
            self.timestamp,
        )
    }
}

/// Known peer (directory persistence)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub peer_id: PeerId,
    pub address: PeerAddress,
    pub last_seen: i64,
}

/// Identity information for the local node
#[derive(Debug, Clone)]
pub struct Identity {
    pub peer_id: PeerId,
    pub created_at: i64,
}
