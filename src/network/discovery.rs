//! LAN presence over UDP. Each node periodically broadcasts its peer id and
//! TCP listen port; every announcement heard from another node lands in the
//! peer directory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::common::{PeerAddress, PeerId};
use crate::error::{ChatError, FrameError};

use super::directory::PeerDirectory;

const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Announcement {
    Discovery { peer_id: PeerId, port: u16 },
}

pub struct Discovery {
    socket: UdpSocket,
    local_peer_id: PeerId,
    listen_port: u16,
    directory: Arc<PeerDirectory>,
}

impl Discovery {
    /// Binds the announcement socket. `listen_port` is the TCP port peers
    /// should dial.
    pub async fn bind(
        addr: &str,
        local_peer_id: PeerId,
        listen_port: u16,
        directory: Arc<PeerDirectory>,
    ) -> Result<Self, ChatError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        log::info!("Discovery bound on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            local_peer_id,
            listen_port,
            directory,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn announce(&self, target: SocketAddr) -> Result<(), ChatError> {
        let announcement = Announcement::Discovery {
            peer_id: self.local_peer_id.clone(),
            port: self.listen_port,
        };
        let payload = serde_json::to_vec(&announcement).map_err(FrameError::from)?;
        self.socket.send_to(&payload, target).await?;
        log::debug!("Announced {} to {target}", self.local_peer_id);
        Ok(())
    }

    /// Waits for one datagram and records the sender if it is another peer.
    pub async fn recv_once(&self) -> Result<Option<(PeerId, PeerAddress)>, ChatError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok(self.handle_datagram(&buf[..len], from))
    }

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Option<(PeerId, PeerAddress)> {
        let Announcement::Discovery { peer_id, port } = match serde_json::from_slice::<Announcement>(data) {
            Ok(announcement) => announcement,
            Err(err) => {
                log::debug!("Ignoring malformed datagram from {from}: {err}");
                return None;
            }
        };

        if peer_id == self.local_peer_id {
            return None;
        }

        let address = PeerAddress::new(from.ip().to_string(), port);
        match self.directory.upsert(peer_id.clone(), address.clone()) {
            Some(previous) if previous == address => {}
            Some(previous) => {
                log::info!("Peer {peer_id} moved from {previous} to {address}");
            }
            None => log::info!("Discovered peer {peer_id} at {address}"),
        }
        Some((peer_id, address))
    }

    /// Announces every `interval` and listens between announcements until
    /// `cancel` fires.
    pub async fn run(self, interval: Duration, target: SocketAddr, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.announce(target).await {
                        log::warn!("Discovery announcement failed: {err}");
                    }
                }
                result = self.recv_once() => {
                    if let Err(err) = result {
                        log::warn!("Discovery receive failed: {err}");
                    }
                }
            }
        }
        log::debug!("Discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound(peer: &str, port: u16, directory: Arc<PeerDirectory>) -> Discovery {
        Discovery::bind("127.0.0.1:0", PeerId::from(peer), port, directory)
            .await
            .unwrap()
    }

    #[test]
    fn announcement_wire_format() {
        let json = serde_json::to_value(Announcement::Discovery {
            peer_id: PeerId::from("alice"),
            port: 5001,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "discovery", "peer_id": "alice", "port": 5001 })
        );
    }

    #[tokio::test]
    async fn announcement_reaches_directory() {
        let alice = bound("alice", 6001, Arc::new(PeerDirectory::new())).await;
        let bob_directory = Arc::new(PeerDirectory::new());
        let bob = bound("bob", 6002, Arc::clone(&bob_directory)).await;

        alice.announce(bob.local_addr().unwrap()).await.unwrap();
        let heard = bob.recv_once().await.unwrap();

        let expected = PeerAddress::new("127.0.0.1", 6001);
        assert_eq!(heard, Some((PeerId::from("alice"), expected.clone())));
        assert_eq!(bob_directory.lookup(&PeerId::from("alice")), Some(expected));
    }

    #[tokio::test]
    async fn own_and_malformed_datagrams_are_ignored() {
        let directory = Arc::new(PeerDirectory::new());
        let alice = bound("alice", 6001, Arc::clone(&directory)).await;
        let from: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let own = br#"{"type":"discovery","peer_id":"alice","port":6001}"#;
        assert!(alice.handle_datagram(own, from).is_none());
        assert!(alice.handle_datagram(b"not json", from).is_none());
        assert!(alice.handle_datagram(br#"{"type":"chat"}"#, from).is_none());
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let alice = bound("alice", 6001, Arc::new(PeerDirectory::new())).await;
        let target = alice.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(alice.run(Duration::from_millis(20), target, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
