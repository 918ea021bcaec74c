use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::common::{Direction, MessageEnvelope, NetworkEvent, PeerAddress, PeerId};
use crate::config::NetworkConfig;
use crate::error::{ChatError, FrameError};

use super::protocol::WireFrame;
use super::transport::{FramedStream, dial, encoded_len, frame_stream};

type FrameSink = SplitSink<FramedStream, WireFrame>;
type FrameSource = SplitStream<FramedStream>;

struct PeerConnection {
    connection_id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    direction: Direction,
    established: Instant,
    sink: Arc<Mutex<FrameSink>>,
    cancel: CancellationToken,
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub connection_id: u64,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub direction: Direction,
}

/// Owns every identified peer connection, keyed by peer id.
///
/// Each connection is driven by its own read task. Decoded envelopes and
/// connect/disconnect notifications are published on the channel returned
/// by [`ConnectionManager::new`].
pub struct ConnectionManager {
    local_peer_id: PeerId,
    config: NetworkConfig,
    connections: RwLock<HashMap<PeerId, PeerConnection>>,
    events: mpsc::Sender<NetworkEvent>,
    listen_port: RwLock<Option<u16>>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        local_peer_id: PeerId,
        config: NetworkConfig,
    ) -> (Arc<Self>, mpsc::Receiver<NetworkEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_queue_capacity);
        let manager = Arc::new(Self {
            local_peer_id,
            config,
            connections: RwLock::new(HashMap::new()),
            events,
            listen_port: RwLock::new(None),
            next_connection_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        (manager, events_rx)
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Starts accepting inbound connections and returns the bound address.
    pub async fn listen(self: &Arc<Self>, bind: &str) -> Result<SocketAddr, ChatError> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        *self.listen_port.write() = Some(addr.port());
        log::info!("Listening for incoming connections on {addr}");

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            mgr.accept_loop(listener).await;
        });

        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let mgr = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(err) = mgr.accept_connection(stream, addr).await {
                                    log::warn!("Incoming connection from {addr} dropped: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            log::error!("Accept error: {err}");
                        }
                    }
                }
            }
        }
        log::debug!("Accept loop stopped");
    }

    async fn accept_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ChatError> {
        log::info!("Incoming connection from {addr}");
        let mut framed = frame_stream(stream, &self.config);

        let (peer_id, listen_port) = tokio::time::timeout(
            self.config.handshake_timeout,
            read_identity(&mut framed, addr),
        )
        .await
        .map_err(|_| ChatError::HandshakeTimeout)??;

        if peer_id == self.local_peer_id {
            return Err(ChatError::HandshakeFailed(format!(
                "{addr} identified as the local peer"
            )));
        }

        framed.send(self.identity_frame()).await.map_err(|e| {
            ChatError::HandshakeFailed(format!("failed to send identity to {addr}: {e}"))
        })?;

        let address = listen_port.map(|port| PeerAddress::new(addr.ip().to_string(), port));
        self.register(peer_id, addr, address, Direction::Inbound, framed)
            .await;
        Ok(())
    }

    /// Opens an outbound connection and exchanges identities with `peer_id`.
    ///
    /// Bounded by the connect and handshake timeouts. Does not touch the
    /// peer directory. Also `Ok` when a simultaneous connection from the peer
    /// wins the cross-connect tie-break, since the peer is connected either way.
    pub async fn connect(
        self: &Arc<Self>,
        peer_id: &PeerId,
        address: &PeerAddress,
    ) -> Result<(), ChatError> {
        log::info!("Connecting to peer {peer_id} at {address}...");
        let mut framed = dial(address, &self.config).await?;
        let remote_addr = framed.get_ref().peer_addr()?;

        framed.send(self.identity_frame()).await.map_err(|e| {
            ChatError::HandshakeFailed(format!("failed to send identity to {address}: {e}"))
        })?;

        let (remote_id, _) = tokio::time::timeout(
            self.config.handshake_timeout,
            read_identity(&mut framed, remote_addr),
        )
        .await
        .map_err(|_| ChatError::HandshakeTimeout)??;

        if &remote_id != peer_id {
            return Err(ChatError::HandshakeFailed(format!(
                "expected {peer_id} at {address}, peer identified as {remote_id}"
            )));
        }

        self.register(
            remote_id,
            remote_addr,
            Some(address.clone()),
            Direction::Outbound,
            framed,
        )
        .await;
        Ok(())
    }

    fn identity_frame(&self) -> WireFrame {
        WireFrame::Identity {
            peer_id: self.local_peer_id.clone(),
            listen_port: *self.listen_port.read(),
        }
    }

    /// The peer that opened a connection seen from this side in `direction`.
    fn dialer<'a>(&'a self, peer_id: &'a PeerId, direction: Direction) -> &'a PeerId {
        match direction {
            Direction::Outbound => &self.local_peer_id,
            Direction::Inbound => peer_id,
        }
    }

    /// Two handshakes in opposite directions within one handshake window are
    /// a cross-connect. Both sides keep the connection dialed by the smaller
    /// peer id; any other newer handshake replaces the older one.
    fn keeps_existing(&self, peer_id: &PeerId, existing: &PeerConnection, direction: Direction) -> bool {
        existing.direction != direction
            && existing.established.elapsed() < self.config.handshake_timeout
            && self.dialer(peer_id, existing.direction) < self.dialer(peer_id, direction)
    }

    /// Returns `false` if the connection lost a cross-connect tie-break and
    /// was dropped in favour of the live one.
    async fn register(
        self: &Arc<Self>,
        peer_id: PeerId,
        remote_addr: SocketAddr,
        address: Option<PeerAddress>,
        direction: Direction,
        framed: FramedStream,
    ) -> bool {
        let local_addr = framed.get_ref().local_addr().unwrap_or(remote_addr);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();

        let (stream, superseded) = {
            let mut conns = self.connections.write();
            if let Some(existing) = conns.get(&peer_id) {
                if self.keeps_existing(&peer_id, existing, direction) {
                    log::info!(
                        "Cross-connect with {peer_id}: keeping #{}, dropping {direction:?} {remote_addr}",
                        existing.connection_id
                    );
                    return false;
                }
            }

            let (sink, stream) = framed.split();
            let superseded = conns.insert(
                peer_id.clone(),
                PeerConnection {
                    connection_id,
                    local_addr,
                    remote_addr,
                    direction,
                    established: Instant::now(),
                    sink: Arc::new(Mutex::new(sink)),
                    cancel: cancel.clone(),
                },
            );
            (stream, superseded)
        };

        if let Some(old) = superseded {
            log::info!(
                "Connection #{} to {peer_id} superseded by #{connection_id}",
                old.connection_id
            );
            old.cancel.cancel();
        }

        log::info!("Peer {peer_id} connected ({direction:?}, {remote_addr}, #{connection_id})");

        // Published before the read task starts so it precedes this peer's frames.
        let _ = self
            .events
            .send(NetworkEvent::PeerConnected {
                peer_id: peer_id.clone(),
                address,
                direction,
            })
            .await;

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            mgr.read_loop(peer_id, connection_id, stream, cancel).await;
        });
        true
    }

    async fn read_loop(
        self: Arc<Self>,
        peer_id: PeerId,
        connection_id: u64,
        mut stream: FrameSource,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WireFrame::Identity { .. })) => {
                            log::warn!("Protocol violation from {peer_id}: identity after handshake; closing");
                            break;
                        }
                        Some(Ok(frame)) => {
                            let Some(envelope) = frame.into_envelope(&self.local_peer_id) else {
                                continue;
                            };
                            let event = NetworkEvent::MessageReceived {
                                peer_id: peer_id.clone(),
                                envelope,
                            };
                            if self.events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            log::warn!("Error reading from {peer_id}: {err}; closing connection");
                            break;
                        }
                        None => {
                            log::info!("Connection to {peer_id} closed by remote");
                            break;
                        }
                    }
                }
            }
        }

        self.release(&peer_id, connection_id).await;
    }

    /// Drops the table entry only if it still belongs to `connection_id`.
    async fn release(&self, peer_id: &PeerId, connection_id: u64) {
        let removed = {
            let mut conns = self.connections.write();
            let is_current = conns
                .get(peer_id)
                .is_some_and(|conn| conn.connection_id == connection_id);
            if is_current {
                conns.remove(peer_id)
            } else {
                None
            }
        };

        if let Some(conn) = removed {
            conn.cancel.cancel();
            log::info!("Peer {peer_id} disconnected (#{connection_id})");
            let _ = self
                .events
                .send(NetworkEvent::PeerDisconnected {
                    peer_id: peer_id.clone(),
                })
                .await;
        }
    }

    /// Writes `envelope` to the live connection for `peer_id`.
    ///
    /// `true` means the transport accepted the write, not that the peer
    /// received it. Never dials; `false` if no connection exists or the
    /// write failed. Only an I/O failure closes the connection.
    pub async fn send(&self, peer_id: &PeerId, envelope: &MessageEnvelope) -> bool {
        let Some((sink, cancel)) = self
            .connections
            .read()
            .get(peer_id)
            .map(|conn| (Arc::clone(&conn.sink), conn.cancel.clone()))
        else {
            return false;
        };

        let result = sink.lock().await.send(WireFrame::from(envelope)).await;
        match result {
            Ok(()) => {
                log::debug!("Sent {:?} {} to {peer_id}", envelope.kind, envelope.message_id);
                true
            }
            Err(FrameError::Io(err)) => {
                log::warn!(
                    "Failed to send {} to {peer_id}: {err}; closing connection",
                    envelope.message_id
                );
                cancel.cancel();
                false
            }
            // Rejected by the encoder before any byte was written.
            Err(err) => {
                log::warn!("Cannot send {} to {peer_id}: {err}", envelope.message_id);
                false
            }
        }
    }

    /// Fails if `envelope` would not fit in one frame on any connection.
    pub fn check_frame_size(&self, envelope: &MessageEnvelope) -> Result<(), ChatError> {
        let size = encoded_len(&WireFrame::from(envelope))?;
        if size > self.config.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.config.max_frame_size,
            }
            .into());
        }
        Ok(())
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connections.read().contains_key(peer_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn connected_peers(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .iter()
            .map(|(peer_id, conn)| ConnectionInfo {
                peer_id: peer_id.clone(),
                connection_id: conn.connection_id,
                local_addr: conn.local_addr,
                remote_addr: conn.remote_addr,
                direction: conn.direction,
            })
            .collect()
    }

    /// Closes the connection to `peer_id`, if any.
    pub async fn disconnect(&self, peer_id: &PeerId) -> bool {
        let removed = self.connections.write().remove(peer_id);
        match removed {
            Some(conn) => {
                conn.cancel.cancel();
                log::info!("Peer {peer_id} disconnected (manual)");
                let _ = self
                    .events
                    .send(NetworkEvent::PeerDisconnected {
                        peer_id: peer_id.clone(),
                    })
                    .await;
                true
            }
            None => false,
        }
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.write().clear();
        log::info!("Connection manager shut down");
    }
}

async fn read_identity(
    framed: &mut FramedStream,
    addr: SocketAddr,
) -> Result<(PeerId, Option<u16>), ChatError> {
    match framed.next().await {
        Some(Ok(WireFrame::Identity {
            peer_id,
            listen_port,
        })) => Ok((peer_id, listen_port)),
        Some(Ok(other)) => Err(ChatError::ProtocolViolation {
            peer: addr.to_string(),
            reason: format!("expected identity, got {}", other.kind()),
        }),
        Some(Err(err)) => Err(err.into()),
        None => Err(ChatError::HandshakeFailed(format!(
            "{addr} closed before identifying"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::codec::Framed;

    use super::*;
    use crate::network::transport::FrameCodec;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            max_frame_size: 64 * 1024,
            event_queue_capacity: 64,
        }
    }

    async fn next_connected(rx: &mut mpsc::Receiver<NetworkEvent>) -> (PeerId, Direction) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if let NetworkEvent::PeerConnected {
                peer_id, direction, ..
            } = event
            {
                return (peer_id, direction);
            }
        }
    }

    #[tokio::test]
    async fn handshake_registers_both_sides() {
        let (alice, mut alice_rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let (bob, mut bob_rx) = ConnectionManager::new(PeerId::from("bob"), test_config());
        let bob_addr = bob.listen("127.0.0.1:0").await.unwrap();

        alice
            .connect(&PeerId::from("bob"), &PeerAddress::from(bob_addr))
            .await
            .unwrap();

        assert_eq!(
            next_connected(&mut alice_rx).await,
            (PeerId::from("bob"), Direction::Outbound)
        );
        assert_eq!(
            next_connected(&mut bob_rx).await,
            (PeerId::from("alice"), Direction::Inbound)
        );
        assert!(alice.is_connected(&PeerId::from("bob")));
        assert!(bob.is_connected(&PeerId::from("alice")));
    }

    #[tokio::test]
    async fn connect_fails_when_peer_identifies_differently() {
        let (alice, _alice_rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let (bob, _bob_rx) = ConnectionManager::new(PeerId::from("bob"), test_config());
        let bob_addr = bob.listen("127.0.0.1:0").await.unwrap();

        let result = alice
            .connect(&PeerId::from("carol"), &PeerAddress::from(bob_addr))
            .await;
        assert!(matches!(result, Err(ChatError::HandshakeFailed(_))));
        assert_eq!(alice.connection_count(), 0);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let (alice, _rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let result = alice
            .connect(&PeerId::from("bob"), &PeerAddress::from(addr))
            .await;
        assert!(result.is_err());
        assert!(!alice.is_connected(&PeerId::from("bob")));
    }

    #[tokio::test]
    async fn send_without_connection_returns_false() {
        let (alice, _rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let envelope = MessageEnvelope::chat(
            "alice-1".into(),
            PeerId::from("alice"),
            PeerId::from("bob"),
            "hi".into(),
            1,
        );
        assert!(!alice.send(&PeerId::from("bob"), &envelope).await);
    }

    #[tokio::test]
    async fn send_delivers_envelope_to_remote_event_channel() {
        let (alice, _alice_rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let (bob, mut bob_rx) = ConnectionManager::new(PeerId::from("bob"), test_config());
        let bob_addr = bob.listen("127.0.0.1:0").await.unwrap();
        alice
            .connect(&PeerId::from("bob"), &PeerAddress::from(bob_addr))
            .await
            .unwrap();

        let envelope = MessageEnvelope::chat(
            "alice-1".into(),
            PeerId::from("alice"),
            PeerId::from("bob"),
            "hi".into(),
            1,
        );
        assert!(alice.send(&PeerId::from("bob"), &envelope).await);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let NetworkEvent::MessageReceived { peer_id, envelope: got } = event {
                assert_eq!(peer_id.as_str(), "alice");
                assert_eq!(got, envelope);
                break;
            }
        }
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_connection() {
        let (alice, _alice_rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let (bob, _bob_rx) = ConnectionManager::new(PeerId::from("bob"), test_config());
        let bob_addr = PeerAddress::from(bob.listen("127.0.0.1:0").await.unwrap());

        alice.connect(&PeerId::from("bob"), &bob_addr).await.unwrap();
        let first = alice.connected_peers()[0].connection_id;
        alice.connect(&PeerId::from("bob"), &bob_addr).await.unwrap();

        let peers = alice.connected_peers();
        assert_eq!(peers.len(), 1);
        assert_ne!(peers[0].connection_id, first);

        // The superseded read task must not evict the newer entry.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(alice.connection_count(), 1);
        assert_eq!(bob.connection_count(), 1);
    }

    #[tokio::test]
    async fn superseded_connection_is_closed() {
        let (alice, _alice_rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let (bob, _bob_rx) = ConnectionManager::new(PeerId::from("bob"), test_config());
        let bob_addr = bob.listen("127.0.0.1:0").await.unwrap();

        let stream = TcpStream::connect(bob_addr).await.unwrap();
        let mut stale = Framed::new(stream, FrameCodec::new(64 * 1024));
        stale
            .send(WireFrame::Identity {
                peer_id: PeerId::from("alice"),
                listen_port: None,
            })
            .await
            .unwrap();
        let reply = stale.next().await.unwrap().unwrap();
        assert_eq!(reply.kind(), "identity");
        while !bob.is_connected(&PeerId::from("alice")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        alice
            .connect(&PeerId::from("bob"), &PeerAddress::from(bob_addr))
            .await
            .unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), stale.next())
            .await
            .expect("superseded connection stayed open");
        assert!(matches!(next, None | Some(Err(_))));

        let kept = bob.connected_peers();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].remote_addr, alice.connected_peers()[0].local_addr);
    }

    fn share_one_socket(alice: &ConnectionManager, bob: &ConnectionManager) -> bool {
        let (a, b) = (alice.connected_peers(), bob.connected_peers());
        a.len() == 1
            && b.len() == 1
            && a[0].local_addr == b[0].remote_addr
            && a[0].remote_addr == b[0].local_addr
    }

    #[tokio::test]
    async fn cross_connect_settles_on_one_shared_connection() {
        let (alice_id, bob_id) = (PeerId::from("alice"), PeerId::from("bob"));

        for _ in 0..10 {
            let (alice, _alice_rx) = ConnectionManager::new(alice_id.clone(), test_config());
            let (bob, _bob_rx) = ConnectionManager::new(bob_id.clone(), test_config());
            let alice_addr = PeerAddress::from(alice.listen("127.0.0.1:0").await.unwrap());
            let bob_addr = PeerAddress::from(bob.listen("127.0.0.1:0").await.unwrap());

            let (to_bob, to_alice) = tokio::join!(
                alice.connect(&bob_id, &bob_addr),
                bob.connect(&alice_id, &alice_addr)
            );
            assert!(to_bob.is_ok() || to_alice.is_ok());

            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !share_one_socket(&alice, &bob) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            // Late closes of the losing socket must not undo the outcome.
            tokio::time::sleep(Duration::from_millis(300)).await;

            assert!(share_one_socket(&alice, &bob));
            // The smaller peer id dialed the surviving connection.
            assert_eq!(alice.connected_peers()[0].direction, Direction::Outbound);
            assert_eq!(bob.connected_peers()[0].direction, Direction::Inbound);

            alice.shutdown();
            bob.shutdown();
        }
    }

    #[tokio::test]
    async fn oversized_envelope_keeps_connection_open() {
        let config = NetworkConfig {
            max_frame_size: 512,
            ..test_config()
        };
        let (alice, _alice_rx) = ConnectionManager::new(PeerId::from("alice"), config);
        let (bob, mut bob_rx) = ConnectionManager::new(PeerId::from("bob"), config);
        let bob_addr = PeerAddress::from(bob.listen("127.0.0.1:0").await.unwrap());
        alice.connect(&PeerId::from("bob"), &bob_addr).await.unwrap();

        let chat = |id: &str, content: String| {
            MessageEnvelope::chat(id.into(), PeerId::from("alice"), PeerId::from("bob"), content, 1)
        };
        let big = chat("alice-1", "x".repeat(600));
        assert!(matches!(
            alice.check_frame_size(&big),
            Err(ChatError::Frame(FrameError::TooLarge { .. }))
        ));
        assert!(!alice.send(&PeerId::from("bob"), &big).await);

        assert!(alice.is_connected(&PeerId::from("bob")));
        let small = chat("alice-2", "small".into());
        assert!(alice.check_frame_size(&small).is_ok());
        assert!(alice.send(&PeerId::from("bob"), &small).await);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let NetworkEvent::MessageReceived { envelope, .. } = event {
                assert_eq!(envelope.message_id, "alice-2");
                break;
            }
        }
    }

    #[tokio::test]
    async fn disconnect_removes_entry() {
        let (alice, _alice_rx) = ConnectionManager::new(PeerId::from("alice"), test_config());
        let (bob, _bob_rx) = ConnectionManager::new(PeerId::from("bob"), test_config());
        let bob_addr = PeerAddress::from(bob.listen("127.0.0.1:0").await.unwrap());
        alice.connect(&PeerId::from("bob"), &bob_addr).await.unwrap();

        assert!(alice.disconnect(&PeerId::from("bob")).await);
        assert!(!alice.is_connected(&PeerId::from("bob")));
        assert!(!alice.disconnect(&PeerId::from("bob")).await);
    }
}
