use std::collections::HashMap;

use parking_lot::RwLock;

use crate::common::{PeerAddress, PeerId};

/// Where each known peer was last seen. A single lock guards the whole table.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, PeerAddress>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `address` for `peer_id`, returning the address it replaced.
    pub fn upsert(&self, peer_id: PeerId, address: PeerAddress) -> Option<PeerAddress> {
        let previous = self.peers.write().insert(peer_id.clone(), address.clone());
        if previous.as_ref() != Some(&address) {
            log::debug!("Directory: {peer_id} -> {address}");
        }
        previous
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<PeerAddress> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerAddress> {
        self.peers.write().remove(peer_id)
    }

    /// Snapshot of every entry; order is unspecified.
    pub fn list(&self) -> Vec<(PeerId, PeerAddress)> {
        self.peers
            .read()
            .iter()
            .map(|(peer_id, address)| (peer_id.clone(), address.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
