use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Stable identifier of a chat participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Last-known network location of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ChatError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ChatError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ChatError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Chat,
    DeliveryAck,
}

/// A chat message or an acknowledgment travelling between two peers.
///
/// `message_id` is the idempotency key for storage and ack matching. For a
/// `DeliveryAck` it names the chat being acknowledged, `sender_id` is the
/// acknowledging peer and `content` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub sender_id: PeerId,
    pub recipient_id: PeerId,
    pub content: String,
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub kind: EnvelopeKind,
}

impl MessageEnvelope {
    pub fn chat(
        message_id: String,
        sender_id: PeerId,
        recipient_id: PeerId,
        content: String,
        timestamp: i64,
    ) -> Self {
        Self {
            message_id,
            sender_id,
            recipient_id,
            content,
            timestamp,
            kind: EnvelopeKind::Chat,
        }
    }

    /// Acknowledgment for `original`, sent back by `local_id`.
    pub fn delivery_ack(original: &MessageEnvelope, local_id: &PeerId) -> Self {
        Self {
            message_id: original.message_id.clone(),
            sender_id: local_id.clone(),
            recipient_id: original.sender_id.clone(),
            content: String::new(),
            timestamp: Utc::now().timestamp_millis(),
            kind: EnvelopeKind::DeliveryAck,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let addr: PeerAddress = "192.168.1.4:5001".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("192.168.1.4", 5001));
        assert_eq!(addr.to_string(), "192.168.1.4:5001");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr: PeerAddress = "[::1]:7000".parse().unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.to_string(), "[::1]:7000");
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!("no-port".parse::<PeerAddress>().is_err());
        assert!(":5000".parse::<PeerAddress>().is_err());
        assert!("host:99999".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn delivery_ack_points_back_at_sender() {
        let chat = MessageEnvelope::chat(
            "alice-1".into(),
            PeerId::from("alice"),
            PeerId::from("bob"),
            "hi".into(),
            1,
        );
        let ack = MessageEnvelope::delivery_ack(&chat, &PeerId::from("bob"));
        assert_eq!(ack.message_id, "alice-1");
        assert_eq!(ack.sender_id.as_str(), "bob");
        assert_eq!(ack.recipient_id.as_str(), "alice");
        assert_eq!(ack.kind, EnvelopeKind::DeliveryAck);
    }
}
