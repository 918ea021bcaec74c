use super::types::{MessageEnvelope, PeerAddress, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Events published by the connection manager.
///
/// All connections share one channel, so events coming from a single
/// connection keep their receipt order.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Handshake completed. `address` is where the peer can be reached, if known.
    PeerConnected {
        peer_id: PeerId,
        address: Option<PeerAddress>,
        direction: Direction,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    MessageReceived {
        peer_id: PeerId,
        envelope: MessageEnvelope,
    },
}
