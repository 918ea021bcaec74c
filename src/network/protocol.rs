use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::common::{EnvelopeKind, MessageEnvelope, PeerId};

/// One frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    Identity {
        peer_id: PeerId,
        /// TCP port the sender accepts connections on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
    },
    Chat {
        message_id: String,
        sender_id: PeerId,
        recipient_id: PeerId,
        content: String,
        timestamp: i64,
    },
    DeliveryAck {
        message_id: String,
        /// The peer acknowledging, i.e. the recipient of the chat.
        recipient_id: PeerId,
    },
}

impl WireFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity",
            Self::Chat { .. } => "chat",
            Self::DeliveryAck { .. } => "delivery_ack",
        }
    }

    /// Converts a data frame into an envelope addressed to `local_id`.
    /// Identity frames carry no envelope.
    pub fn into_envelope(self, local_id: &PeerId) -> Option<MessageEnvelope> {
        match self {
            Self::Identity { .. } => None,
            Self::Chat {
                message_id,
                sender_id,
                recipient_id,
                content,
                timestamp,
            } => Some(MessageEnvelope::chat(
                message_id,
                sender_id,
                recipient_id,
                content,
                timestamp,
            )),
            Self::DeliveryAck {
                message_id,
                recipient_id,
            } => Some(MessageEnvelope {
                message_id,
                sender_id: recipient_id,
                recipient_id: local_id.clone(),
                content: String::new(),
                timestamp: Utc::now().timestamp_millis(),
                kind: EnvelopeKind::DeliveryAck,
            }),
        }
    }
}

impl From<&MessageEnvelope> for WireFrame {
    fn from(envelope: &MessageEnvelope) -> Self {
        match envelope.kind {
            EnvelopeKind::Chat => Self::Chat {
                message_id: envelope.message_id.clone(),
                sender_id: envelope.sender_id.clone(),
                recipient_id: envelope.recipient_id.clone(),
                content: envelope.content.clone(),
                timestamp: envelope.timestamp,
            },
            EnvelopeKind::DeliveryAck => Self::DeliveryAck {
                message_id: envelope.message_id.clone(),
                recipient_id: envelope.sender_id.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn frames_are_tagged_by_type() {
        let frame = WireFrame::Identity {
            peer_id: PeerId::from("alice"),
            listen_port: None,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "identity", "peer_id": "alice" })
        );

        let frame = WireFrame::DeliveryAck {
            message_id: "alice-1".into(),
            recipient_id: PeerId::from("bob"),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "delivery_ack", "message_id": "alice-1", "recipient_id": "bob" })
        );
    }

    #[test]
    fn identity_without_port_still_decodes() {
        let frame: WireFrame =
            serde_json::from_str(r#"{"type":"identity","peer_id":"carol"}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Identity {
                peer_id: PeerId::from("carol"),
                listen_port: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<WireFrame>(r#"{"type":"find_node","target_id":"x"}"#).is_err());
    }

    #[test]
    fn ack_frame_becomes_envelope_from_acknowledger() {
        let chat = MessageEnvelope::chat(
            "alice-7".into(),
            PeerId::from("alice"),
            PeerId::from("bob"),
            "hi".into(),
            7,
        );
        let ack = MessageEnvelope::delivery_ack(&chat, &PeerId::from("bob"));

        let frame = WireFrame::from(&ack);
        let decoded = frame.into_envelope(&PeerId::from("alice")).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::DeliveryAck);
        assert_eq!(decoded.message_id, "alice-7");
        assert_eq!(decoded.sender_id.as_str(), "bob");
        assert_eq!(decoded.recipient_id.as_str(), "alice");
    }

    #[test]
    fn chat_frame_keeps_every_field() {
        let chat = MessageEnvelope::chat(
            "alice-9".into(),
            PeerId::from("alice"),
            PeerId::from("bob"),
            "see you".into(),
            9,
        );
        let decoded = WireFrame::from(&chat)
            .into_envelope(&PeerId::from("bob"))
            .unwrap();
        assert_eq!(decoded, chat);
    }
}
