//! WebSocket sync server with per-document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── DocumentStore (RocksDB)
//!             ├── connection task ──┤        │
//! Client B ──┘    (one per socket)  │        ├── rooms   (LZ4)
//!                     │             │        └── players (LZ4)
//!                     ▼             │
//!               DocumentHub ────────┘
//!                     │
//!          ┌──────────┼───────────┐    BroadcastGroup per document
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! A connection may subscribe to several documents (typically its room
//! and its own player document). For each subscription a forwarder task
//! copies committed frames from the document's broadcast group onto the
//! socket, so the author of a publish receives its own snapshot too.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 3 & 5

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::hub::{DocumentHub, HubConfig, HubError};
use crate::protocol::{DocumentKey, MessageType, PeerInfo, SyncMessage};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per document
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `TAVERN_BIND`, `TAVERN_DATA_DIR`,
    /// `TAVERN_BROADCAST_CAPACITY`, `TAVERN_MAX_PEERS` and
    /// `TAVERN_HEARTBEAT_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup("TAVERN_BIND").unwrap_or(defaults.bind_addr),
            storage_path: lookup("TAVERN_DATA_DIR")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            broadcast_capacity: parse_or(&lookup, "TAVERN_BROADCAST_CAPACITY", defaults.broadcast_capacity),
            max_peers_per_room: parse_or(&lookup, "TAVERN_MAX_PEERS", defaults.max_peers_per_room),
            heartbeat_interval_secs: parse_or(
                &lookup,
                "TAVERN_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            ),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_peers_per_room: self.max_peers_per_room,
        }
    }
}

fn parse_or<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {key}={raw:?}, using default");
            default
        }),
        None => default,
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub publishes: u64,
    pub rejected_publishes: u64,
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<DocumentHub>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the document store if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(DocumentStore::open(store_config)?))
            }
            None => None,
        };
        let hub = Arc::new(DocumentHub::new(config.hub_config(), store));
        Ok(Self::with_hub(config, hub))
    }

    /// Serve an existing hub (shared with in-process channels).
    pub fn with_hub(config: ServerConfig, hub: Arc<DocumentHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let hub = Arc::new(DocumentHub::new(config.hub_config(), None));
        Self::with_hub(config, hub)
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Load persisted documents so they are served without a disk read.
    pub async fn recover(&self) -> Result<usize, HubError> {
        self.hub.recover().await
    }

    /// Bind the configured address, recover, and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.clone().serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Forwarders and the read loop share one writer
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.broadcast_capacity.max(16));
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut conn = Connection {
            peer: None,
            forwarders: HashMap::new(),
            out: out_tx,
        };

        let mut heartbeat = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match SyncMessage::decode(&bytes) {
                                Ok(frame) => {
                                    if self.handle_frame(&mut conn, frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if conn.out.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                _ = heartbeat.tick() => {
                    if conn.out.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Cleanup: leave every document this connection subscribed to
        let peer_id = conn.peer.as_ref().map(|p| p.peer_id);
        for (doc, handle) in conn.forwarders.drain() {
            handle.abort();
            if let Some(pid) = peer_id {
                self.hub.leave(&doc, &pid).await;
            }
        }
        drop(conn);
        let _ = writer.await;

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = self.hub.room_count().await;
        Ok(())
    }

    /// Apply one client frame. `Err` means the socket writer is gone.
    async fn handle_frame(&self, conn: &mut Connection, frame: SyncMessage) -> Result<(), ()> {
        match frame.msg_type {
            MessageType::Join => {
                let info = frame
                    .peer_info()
                    .unwrap_or_else(|_| PeerInfo::with_id(frame.peer_id, "Anonymous"));
                let doc = frame.doc;
                if let Some(old) = conn.forwarders.remove(&doc) {
                    old.abort();
                }
                conn.peer = Some(info.clone());

                match self.hub.join(&doc, info.clone()).await {
                    Ok(joined) => {
                        for existing in &joined.peers {
                            conn.send(&SyncMessage::peer_joined(existing, doc.clone())).await?;
                        }
                        conn.send(&joined.snapshot).await?;
                        let handle = tokio::spawn(forward(
                            self.hub.clone(),
                            doc.clone(),
                            info.peer_id,
                            joined.receiver,
                            conn.out.clone(),
                        ));
                        conn.forwarders.insert(doc, handle);
                        self.stats.write().await.active_rooms = self.hub.room_count().await;
                    }
                    Err(e) => {
                        log::warn!("Join of {doc} by {} refused: {e}", info.name);
                        conn.send(&SyncMessage::rejected(info.peer_id, doc, 0, &e.to_string()))
                            .await?;
                    }
                }
            }

            MessageType::Leave => {
                if let Some(handle) = conn.forwarders.remove(&frame.doc) {
                    handle.abort();
                    self.hub.leave(&frame.doc, &frame.peer_id).await;
                    self.stats.write().await.active_rooms = self.hub.room_count().await;
                }
            }

            MessageType::Publish => {
                let expected = frame.expected_version();
                let result = self
                    .hub
                    .publish(&frame.doc, frame.peer_id, frame.clock, expected, frame.payload)
                    .await;
                match result {
                    Ok(_) => self.stats.write().await.publishes += 1,
                    Err(e) => {
                        log::warn!("Publish to {} from {} rejected: {e}", frame.doc, frame.peer_id);
                        self.stats.write().await.rejected_publishes += 1;
                        let reply = SyncMessage::rejected(frame.peer_id, frame.doc, frame.clock, &e.to_string());
                        conn.send(&reply).await?;
                    }
                }
            }

            MessageType::Ping => {
                conn.send(&SyncMessage::pong(frame.peer_id)).await?;
            }

            other => {
                log::debug!("Unhandled message type: {other:?}");
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<DocumentHub> {
        &self.hub
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.hub.store()
    }
}

/// Per-socket state.
struct Connection {
    peer: Option<PeerInfo>,
    forwarders: HashMap<DocumentKey, JoinHandle<()>>,
    out: mpsc::Sender<Message>,
}

impl Connection {
    async fn send(&self, msg: &SyncMessage) -> Result<(), ()> {
        let encoded = msg.encode().map_err(|e| log::error!("Failed to encode {:?}: {e}", msg.msg_type))?;
        self.out.send(Message::Binary(encoded.into())).await.map_err(|_| ())
    }
}

/// Copy committed frames of one document onto a socket.
async fn forward(
    hub: Arc<DocumentHub>,
    doc: DocumentKey,
    peer_id: Uuid,
    mut frames: broadcast::Receiver<Arc<Vec<u8>>>,
    out: mpsc::Sender<Message>,
) {
    loop {
        let bytes = match frames.recv().await {
            Ok(bytes) => bytes,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Peer {peer_id} lagged by {n} frames on {doc}");
                if let Some(group) = hub.broadcast_group(&doc).await {
                    group.record_lag(n);
                }
                match hub.snapshot(&doc).await.map(|m| m.encode()) {
                    Some(Ok(encoded)) => Arc::new(encoded),
                    _ => continue,
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        // Roster frames about ourselves are not echoed
        if let Ok(msg) = SyncMessage::decode(&bytes) {
            if matches!(msg.msg_type, MessageType::PeerJoined | MessageType::PeerLeft) && msg.peer_id == peer_id {
                continue;
            }
        }

        if out.send(Message::Binary(bytes.as_ref().clone().into())).await.is_err() {
            return;
        }
    }
}
