use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::{MessageEnvelope, NetworkEvent, PeerAddress, PeerId};
use crate::config::{AppConfig, parse_known_peers};
use crate::error::{ChatError, StorageError};
use crate::messaging::MessageDispatcher;
use crate::network::{ConnectionManager, Discovery, PeerDirectory};
use crate::storage::{ClientDatabase, KnownPeer, MessageRecord, MessageStore};

/// Database path that keeps everything in memory.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// A directory entry together with its connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub address: PeerAddress,
    pub online: bool,
}

/// A running chat peer: storage, directory, connections, dispatcher and
/// (optionally) LAN discovery wired together.
pub struct ChatNode {
    local_peer_id: PeerId,
    listen_addr: SocketAddr,
    store: Arc<ClientDatabase>,
    directory: Arc<PeerDirectory>,
    connections: Arc<ConnectionManager>,
    dispatcher: Arc<MessageDispatcher>,
    shutdown: CancellationToken,
}

impl ChatNode {
    pub async fn start(config: AppConfig) -> Result<Self, ChatError> {
        config.validate()?;

        let store = Arc::new(open_store(&config.database_path)?);
        let local_peer_id = load_or_create_identity(&store)?;
        log::info!("Local PeerID: {local_peer_id}");

        let directory = Arc::new(PeerDirectory::new());
        for peer in store.list_peers()? {
            directory.upsert(peer.peer_id, peer.address);
        }
        for (peer_id, address) in parse_known_peers(&config.known_peers) {
            directory.upsert(peer_id, address);
        }
        log::info!("Peer directory seeded with {} peer(s)", directory.len());

        let (connections, events) = ConnectionManager::new(local_peer_id.clone(), config.network());
        let listen_addr = connections.listen(&config.listen_addr).await?;

        let message_store: Arc<dyn MessageStore> = store.clone();
        let dispatcher = Arc::new(
            MessageDispatcher::new(
                Arc::clone(&connections),
                Arc::clone(&directory),
                message_store,
            )
            .with_listener_capacity(config.event_queue_capacity),
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(run_event_loop(
            events,
            Arc::clone(&dispatcher),
            Arc::clone(&directory),
            Arc::clone(&store),
            shutdown.child_token(),
        ));

        if config.discovery_enabled {
            start_discovery(
                &config,
                local_peer_id.clone(),
                listen_addr.port(),
                Arc::clone(&directory),
                shutdown.child_token(),
            )
            .await;
        }

        Ok(Self {
            local_peer_id,
            listen_addr,
            store,
            directory,
            connections,
            dispatcher,
            shutdown,
        })
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// See [`MessageDispatcher::send_message`].
    pub async fn send_message(&self, recipient_id: &PeerId, content: &str) -> Result<bool, ChatError> {
        self.dispatcher.send_message(recipient_id, content).await
    }

    pub async fn get_conversation(
        &self,
        peer_id: &PeerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        self.dispatcher.get_conversation(peer_id, limit).await
    }

    pub async fn flush_pending(&self, peer_id: &PeerId) -> Result<usize, ChatError> {
        self.dispatcher.flush_pending(peer_id).await
    }

    /// Connects to `peer_id`, at `address` or else at its directory entry.
    ///
    /// The directory only learns `address` once the handshake succeeded.
    /// Pending messages are flushed by the resulting connect event.
    pub async fn connect(&self, peer_id: &PeerId, address: Option<PeerAddress>) -> Result<(), ChatError> {
        let address = match address {
            Some(address) => address,
            None if self.connections.is_connected(peer_id) => {
                log::info!("Already connected to {peer_id}");
                return Ok(());
            }
            None => self
                .directory
                .lookup(peer_id)
                .ok_or_else(|| ChatError::PeerNotFound(peer_id.clone()))?,
        };

        self.connections.connect(peer_id, &address).await?;
        remember_peer(&self.directory, &self.store, peer_id.clone(), address).await;
        Ok(())
    }

    /// Directory snapshot, sorted by peer id.
    pub fn peers(&self) -> Vec<PeerStatus> {
        let mut peers: Vec<_> = self
            .directory
            .list()
            .into_iter()
            .map(|(peer_id, address)| PeerStatus {
                online: self.connections.is_connected(&peer_id),
                peer_id,
                address,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Newly received chats, see [`MessageDispatcher::subscribe`].
    pub fn subscribe(&self) -> mpsc::Receiver<MessageEnvelope> {
        self.dispatcher.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.connections.shutdown();
        log::info!("Node {} shut down", self.local_peer_id);
    }
}

fn open_store(path: &str) -> Result<ClientDatabase, StorageError> {
    if path == IN_MEMORY_DATABASE {
        ClientDatabase::in_memory()
    } else {
        ClientDatabase::with_path(path)
    }
}

fn load_or_create_identity(store: &ClientDatabase) -> Result<PeerId, StorageError> {
    if let Some(identity) = store.load_identity()? {
        return Ok(identity.peer_id);
    }
    let peer_id = PeerId::new(Uuid::new_v4().to_string());
    store.save_identity(&peer_id)?;
    log::info!("Generated new identity {peer_id}");
    Ok(peer_id)
}

async fn remember_peer(
    directory: &PeerDirectory,
    store: &Arc<ClientDatabase>,
    peer_id: PeerId,
    address: PeerAddress,
) {
    directory.upsert(peer_id.clone(), address.clone());

    let store = Arc::clone(store);
    let peer = KnownPeer {
        peer_id,
        address,
        last_seen: Utc::now().timestamp(),
    };
    let result = tokio::task::spawn_blocking(move || store.upsert_peer(&peer)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("Failed to persist peer: {err}"),
        Err(err) => log::warn!("Peer persistence task failed: {err}"),
    }
}

async fn start_discovery(
    config: &AppConfig,
    local_peer_id: PeerId,
    listen_port: u16,
    directory: Arc<PeerDirectory>,
    cancel: CancellationToken,
) {
    let bind = format!("0.0.0.0:{}", config.discovery_port);
    let discovery = match Discovery::bind(&bind, local_peer_id, listen_port, directory).await {
        Ok(discovery) => discovery,
        Err(err) => {
            log::warn!("Discovery disabled: cannot bind {bind}: {err}");
            return;
        }
    };

    let target = SocketAddr::from((Ipv4Addr::BROADCAST, config.discovery_port));
    let interval = Duration::from_secs(config.announce_interval_secs);
    tokio::spawn(discovery.run(interval, target, cancel));
}

async fn run_event_loop(
    mut events: mpsc::Receiver<NetworkEvent>,
    dispatcher: Arc<MessageDispatcher>,
    directory: Arc<PeerDirectory>,
    store: Arc<ClientDatabase>,
    cancel: CancellationToken,
) {
    log::info!("Network event loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(event, &dispatcher, &directory, &store).await;
            }
        }
    }
    log::info!("Network event loop stopped");
}

async fn handle_event(
    event: NetworkEvent,
    dispatcher: &Arc<MessageDispatcher>,
    directory: &PeerDirectory,
    store: &Arc<ClientDatabase>,
) {
    match event {
        NetworkEvent::PeerConnected {
            peer_id,
            address,
            direction,
        } => {
            log::debug!("PeerConnected {peer_id} ({direction:?})");
            if let Some(address) = address {
                remember_peer(directory, store, peer_id.clone(), address).await;
            }

            let dispatcher = Arc::clone(dispatcher);
            tokio::spawn(async move {
                if let Err(err) = dispatcher.flush_pending(&peer_id).await {
                    log::error!("Flushing pending messages for {peer_id} failed: {err}");
                }
            });
        }
        NetworkEvent::PeerDisconnected { peer_id } => {
            log::info!("Peer {peer_id} went offline");
        }
        NetworkEvent::MessageReceived { peer_id, envelope } => {
            if let Err(err) = dispatcher.on_incoming(&peer_id, envelope).await {
                log::error!("Failed to handle message from {peer_id}: {err}");
            }
        }
    }
}
