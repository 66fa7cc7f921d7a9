//! WebSocket sync client for connecting to the document server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Per-document subscriptions routed from one socket
//! - Whole-document publishes stamped with a per-client clock
//!
//! Nothing is queued while disconnected: a publish without a connection
//! fails immediately and the caller decides whether to retry.
//!
//! Reference: Kleppmann, DDIA Chapter 5 (Replication)

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{
    ChannelEvent, DocumentSnapshot, ReplicationChannel, Subscription, SyncError, EVENT_BUFFER,
};
use crate::protocol::{DocumentKey, MessageType, PeerInfo, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// How long to wait for the initial snapshot of a subscription
    pub join_timeout: Duration,
    /// Outgoing frame buffer
    pub outgoing_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            join_timeout: Duration::from_secs(5),
            outgoing_buffer: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Result of a join while it waits for its first snapshot.
type JoinReply = Result<(DocumentSnapshot, Vec<PeerInfo>), String>;

/// Where frames for one document go.
struct Route {
    events: mpsc::Sender<ChannelEvent>,
    /// Set until the first snapshot arrives
    pending: Option<oneshot::Sender<JoinReply>>,
    /// Roster collected before the first snapshot
    peers: Vec<PeerInfo>,
}

type Routes = Arc<Mutex<HashMap<DocumentKey, Route>>>;

/// The sync client.
///
/// One WebSocket connection, any number of document subscriptions.
pub struct SyncClient {
    /// Our peer identity
    peer_info: PeerInfo,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    /// Publish sequence; echoed back in the resulting snapshot
    clock: Arc<AtomicU64>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    routes: Routes,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, config: ClientConfig) -> Self {
        Self {
            peer_info,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            routes: Arc::new(Mutex::new(HashMap::new())),
            tasks: Vec::new(),
        }
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::Connection(format!("{}: {e}", self.config.url)));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outgoing_buffer);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: route incoming frames to subscriptions
        let routes = self.routes.clone();
        let state = self.state.clone();
        let out = out_tx.clone();
        let peer_id = self.peer_info.peer_id;
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(frame) => route_frame(&routes, &out, peer_id, frame).await,
                            Err(e) => log::warn!("Failed to decode frame from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            close_routes(&routes).await;
            log::info!("Sync connection closed");
        });

        self.outgoing_tx = Some(out_tx);
        self.tasks = vec![writer, reader];
        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {} as {}", self.config.url, self.peer_info.name);
        Ok(())
    }

    /// Close the connection. Every subscription receives `Closed`.
    pub async fn close(&mut self) {
        // Dropping the sender lets the writer send a close frame and exit.
        self.outgoing_tx = None;
        if let Some(reader) = self.tasks.pop() {
            reader.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        close_routes(&self.routes).await;
    }

    /// Send a heartbeat ping frame.
    pub async fn send_ping(&self) -> Result<(), SyncError> {
        let encoded = SyncMessage::ping(self.peer_info.peer_id).encode()?;
        self.send_raw(encoded)
            .await
            .map_err(|_| SyncError::Connection("not connected".into()))
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub fn server_url(&self) -> &str {
        &self.config.url
    }

    /// Last clock handed out by `publish`.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub async fn subscription_count(&self) -> usize {
        self.routes.lock().await.len()
    }

    async fn send_raw(&self, encoded: Vec<u8>) -> Result<(), ()> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ()),
            None => Err(()),
        }
    }
}

impl ReplicationChannel for SyncClient {
    fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    fn set_display_name(&mut self, name: &str) {
        self.peer_info.name = name.to_string();
    }

    async fn subscribe(&mut self, doc: &DocumentKey) -> Result<Subscription, SyncError> {
        if !self.is_connected().await {
            return Err(SyncError::Connection("not connected".into()));
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.routes.lock().await.insert(
            doc.clone(),
            Route {
                events: event_tx,
                pending: Some(reply_tx),
                peers: Vec::new(),
            },
        );

        let join = SyncMessage::join(&self.peer_info, doc.clone()).encode()?;
        if self.send_raw(join).await.is_err() {
            self.routes.lock().await.remove(doc);
            return Err(SyncError::Connection("not connected".into()));
        }

        match tokio::time::timeout(self.config.join_timeout, reply_rx).await {
            Ok(Ok(Ok((snapshot, peers)))) => {
                log::debug!("Subscribed to {doc} at v{}", snapshot.version);
                Ok(Subscription::new(snapshot, peers, event_rx))
            }
            Ok(Ok(Err(reason))) => {
                self.routes.lock().await.remove(doc);
                Err(SyncError::Connection(reason))
            }
            Ok(Err(_)) => Err(SyncError::Connection("connection closed".into())),
            Err(_) => {
                self.routes.lock().await.remove(doc);
                Err(SyncError::Connection(format!("timed out joining {doc}")))
            }
        }
    }

    async fn publish(
        &self,
        doc: &DocumentKey,
        document: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, SyncError> {
        if !self.is_connected().await {
            return Err(SyncError::Publish("not connected".into()));
        }
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = SyncMessage::publish(self.peer_info.peer_id, doc.clone(), clock, expected_version, document);
        self.send_raw(msg.encode()?)
            .await
            .map_err(|_| SyncError::Publish("connection closed".into()))?;
        Ok(clock)
    }

    async fn unsubscribe(&mut self, doc: &DocumentKey) -> Result<(), SyncError> {
        if self.routes.lock().await.remove(doc).is_none() {
            return Err(SyncError::NotSubscribed(doc.clone()));
        }
        let leave = SyncMessage::leave(self.peer_info.peer_id, doc.clone()).encode()?;
        // Best effort: the server drops our subscriptions on disconnect anyway
        let _ = self.send_raw(leave).await;
        Ok(())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Deliver one server frame to the subscription it belongs to.
async fn route_frame(routes: &Routes, out: &mpsc::Sender<Vec<u8>>, own: uuid::Uuid, frame: SyncMessage) {
    if frame.msg_type == MessageType::Pong {
        log::trace!("Pong from server");
        return;
    }

    let doc = frame.doc.clone();
    let sender = {
        let mut routes = routes.lock().await;
        let Some(route) = routes.get_mut(&doc) else {
            log::debug!("Frame for unsubscribed {doc} ignored");
            return;
        };

        if route.pending.is_some() {
            match frame.msg_type {
                MessageType::Snapshot => {
                    let reply = DocumentSnapshot::from_message(&frame)
                        .map(|s| (s, std::mem::take(&mut route.peers)))
                        .map_err(|e| e.to_string());
                    if let Some(tx) = route.pending.take() {
                        let _ = tx.send(reply);
                    }
                }
                MessageType::Rejected => {
                    let reason = frame.reason().unwrap_or_default();
                    if let Some(tx) = route.pending.take() {
                        let _ = tx.send(Err(reason));
                    }
                    routes.remove(&doc);
                }
                MessageType::PeerJoined if frame.peer_id != own => {
                    if let Ok(info) = frame.peer_info() {
                        route.peers.push(info);
                    }
                }
                MessageType::PeerLeft => route.peers.retain(|p| p.peer_id != frame.peer_id),
                _ => {}
            }
            return;
        }
        route.events.clone()
    };

    let Some(event) = ChannelEvent::from_frame(frame, own) else {
        return;
    };
    if sender.send(event).await.is_err() {
        // Subscription dropped without unsubscribing
        routes.lock().await.remove(&doc);
        if let Ok(leave) = SyncMessage::leave(own, doc).encode() {
            let _ = out.send(leave).await;
        }
    }
}

async fn close_routes(routes: &Routes) {
    let drained: Vec<Route> = routes.lock().await.drain().map(|(_, r)| r).collect();
    for mut route in drained {
        if let Some(tx) = route.pending.take() {
            let _ = tx.send(Err("connection closed".into()));
        }
        let _ = route.events.send(ChannelEvent::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_core::RoomCode;

    fn room_key(code: &str) -> DocumentKey {
        DocumentKey::room(&RoomCode::parse(code).unwrap())
    }

    #[test]
    fn test_client_creation() {
        let info = PeerInfo::new("TestUser");
        let client = SyncClient::new(info, ClientConfig::new("ws://localhost:9090"));

        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.clock(), 0);
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:9090");
        assert_eq!(config.join_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(PeerInfo::new("TestUser"), ClientConfig::default());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_offline_fails_without_queueing() {
        let client = SyncClient::new(PeerInfo::new("TestUser"), ClientConfig::default());
        let err = client.publish(&room_key("abcd"), b"{}".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, SyncError::Publish(_)));
        assert_eq!(client.clock(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_offline_fails() {
        let mut client = SyncClient::new(PeerInfo::new("TestUser"), ClientConfig::default());
        let err = client.subscribe(&room_key("abcd")).await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = SyncClient::new(
            PeerInfo::new("TestUser"),
            ClientConfig::new(format!("ws://127.0.0.1:{port}")),
        );
        assert!(matches!(client.connect().await, Err(SyncError::Connection(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_set_display_name() {
        let mut client = SyncClient::new(PeerInfo::new("Anonymous"), ClientConfig::default());
        let id = client.peer_info().peer_id;
        client.set_display_name("Mira");
        assert_eq!(client.peer_info().name, "Mira");
        assert_eq!(client.peer_info().peer_id, id);
    }
}
