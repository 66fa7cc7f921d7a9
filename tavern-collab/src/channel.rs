//! Publish/subscribe access to replicated documents.
//!
//! A [`ReplicationChannel`] hands out one [`Subscription`] per document key.
//! The subscription starts with the document as it was at join time and
//! then streams every committed snapshot, including the ones this client
//! published itself. Dropping or unsubscribing ends delivery; the remote
//! document is left untouched.
//!
//! Two implementations:
//! - [`LocalChannel`]: in-process, straight onto a shared [`DocumentHub`]
//! - [`SyncClient`](crate::client::SyncClient): WebSocket to a `SyncServer`

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::hub::{DocumentHub, HubError};
use crate::protocol::{DocumentKey, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Events buffered per subscription before the producer waits.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Could not read, create or subscribe to a document
    #[error("connection failed: {0}")]
    Connection(String),
    /// A document write did not reach the hub
    #[error("publish failed: {0}")]
    Publish(String),
    /// The hub refused a publish (schema or version conflict)
    #[error("publish rejected: {reason}")]
    Rejected { reason: String },
    #[error("not subscribed to {0}")]
    NotSubscribed(DocumentKey),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    fn from_hub_publish(e: HubError) -> Self {
        match e {
            HubError::Invalid(_) | HubError::Conflict { .. } => SyncError::Rejected {
                reason: e.to_string(),
            },
            other => SyncError::Publish(other.to_string()),
        }
    }
}

/// A committed document state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub doc: DocumentKey,
    pub version: u64,
    /// Peer whose publish produced this state (nil for created/loaded docs)
    pub author: Uuid,
    /// Author's publish clock
    pub clock: u64,
    /// JSON document
    pub payload: Vec<u8>,
}

impl DocumentSnapshot {
    pub fn from_message(msg: &SyncMessage) -> Result<Self, ProtocolError> {
        if msg.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(Self {
            doc: msg.doc.clone(),
            version: msg.version,
            author: msg.peer_id,
            clock: msg.clock,
            payload: msg.payload.clone(),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Snapshot(DocumentSnapshot),
    /// One of our publishes was refused
    Rejected { clock: u64, reason: String },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The transport is gone; no further events follow
    Closed,
}

impl ChannelEvent {
    /// Map a committed frame to an event for `own` peer.
    ///
    /// Our own roster announcements are dropped; our own snapshots are not.
    pub fn from_frame(msg: SyncMessage, own: Uuid) -> Option<Self> {
        match msg.msg_type {
            MessageType::Snapshot => DocumentSnapshot::from_message(&msg).ok().map(Self::Snapshot),
            MessageType::Rejected => Some(Self::Rejected {
                clock: msg.clock,
                reason: msg.reason().unwrap_or_default(),
            }),
            MessageType::PeerJoined if msg.peer_id != own => msg.peer_info().ok().map(Self::PeerJoined),
            MessageType::PeerLeft if msg.peer_id != own => Some(Self::PeerLeft(msg.peer_id)),
            _ => None,
        }
    }
}

/// Live view of one document.
pub struct Subscription {
    doc: DocumentKey,
    initial: DocumentSnapshot,
    peers: Vec<PeerInfo>,
    events: mpsc::Receiver<ChannelEvent>,
    closed: bool,
}

impl Subscription {
    pub fn new(
        initial: DocumentSnapshot,
        peers: Vec<PeerInfo>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            doc: initial.doc.clone(),
            initial,
            peers,
            events,
            closed: false,
        }
    }

    pub fn doc(&self) -> &DocumentKey {
        &self.doc
    }

    /// Document as it was when the subscription was established.
    pub fn initial(&self) -> &DocumentSnapshot {
        &self.initial
    }

    /// Peers already subscribed at join time.
    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    /// Wait for the next event. Yields `Closed` once, then `None`.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        self.observe(event)
    }

    /// Next event if one is already buffered.
    pub fn try_next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => self.observe(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.observe(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn observe(&mut self, event: Option<ChannelEvent>) -> Option<ChannelEvent> {
        match event {
            Some(ChannelEvent::Closed) | None => {
                self.closed = true;
                Some(ChannelEvent::Closed)
            }
            Some(event) => Some(event),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("doc", &self.doc)
            .field("version", &self.initial.version)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Whole-document publish/subscribe.
pub trait ReplicationChannel: Send {
    fn peer_info(&self) -> &PeerInfo;

    /// Name announced on subsequent joins.
    fn set_display_name(&mut self, name: &str);

    /// Subscribe to `doc`, creating it with defaults if absent. Replaces any
    /// existing subscription to the same key.
    fn subscribe(
        &mut self,
        doc: &DocumentKey,
    ) -> impl Future<Output = Result<Subscription, SyncError>> + Send;

    /// Replace `doc` entirely. Returns the clock stamped on the publish,
    /// which the matching snapshot echoes back.
    fn publish(
        &self,
        doc: &DocumentKey,
        document: Vec<u8>,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<u64, SyncError>> + Send;

    fn unsubscribe(&mut self, doc: &DocumentKey) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// In-process channel onto a shared hub.
pub struct LocalChannel {
    hub: Arc<DocumentHub>,
    info: PeerInfo,
    clock: AtomicU64,
    forwarders: HashMap<DocumentKey, JoinHandle<()>>,
}

impl LocalChannel {
    pub fn new(hub: Arc<DocumentHub>, info: PeerInfo) -> Self {
        Self {
            hub,
            info,
            clock: AtomicU64::new(0),
            forwarders: HashMap::new(),
        }
    }

    pub fn hub(&self) -> &Arc<DocumentHub> {
        &self.hub
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, doc: &DocumentKey) -> bool {
        self.forwarders.get(doc).is_some_and(|h| !h.is_finished())
    }

    async fn release(&mut self, doc: &DocumentKey) -> bool {
        match self.forwarders.remove(doc) {
            Some(handle) => {
                handle.abort();
                self.hub.leave(doc, &self.info.peer_id).await;
                true
            }
            None => false,
        }
    }
}

impl ReplicationChannel for LocalChannel {
    fn peer_info(&self) -> &PeerInfo {
        &self.info
    }

    fn set_display_name(&mut self, name: &str) {
        self.info.name = name.to_string();
    }

    async fn subscribe(&mut self, doc: &DocumentKey) -> Result<Subscription, SyncError> {
        self.release(doc).await;

        let joined = self
            .hub
            .join(doc, self.info.clone())
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let initial = DocumentSnapshot::from_message(&joined.snapshot)?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(forward(
            self.hub.clone(),
            doc.clone(),
            self.info.peer_id,
            joined.receiver,
            tx,
        ));
        self.forwarders.insert(doc.clone(), handle);

        Ok(Subscription::new(initial, joined.peers, rx))
    }

    async fn publish(
        &self,
        doc: &DocumentKey,
        document: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<u64, SyncError> {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.hub
            .publish(doc, self.info.peer_id, clock, expected_version, document)
            .await
            .map_err(SyncError::from_hub_publish)?;
        Ok(clock)
    }

    async fn unsubscribe(&mut self, doc: &DocumentKey) -> Result<(), SyncError> {
        if self.release(doc).await {
            Ok(())
        } else {
            Err(SyncError::NotSubscribed(doc.clone()))
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if self.forwarders.is_empty() {
            return;
        }
        let docs: Vec<DocumentKey> = self.forwarders.keys().cloned().collect();
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
        // Best effort: only possible from inside a runtime.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let peer_id = self.info.peer_id;
            rt.spawn(async move {
                for doc in docs {
                    hub.leave(&doc, &peer_id).await;
                }
            });
        }
    }
}

/// Pump committed frames from the hub into a subscription until either
/// side goes away.
async fn forward(
    hub: Arc<DocumentHub>,
    doc: DocumentKey,
    peer_id: Uuid,
    mut frames: broadcast::Receiver<Arc<Vec<u8>>>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        let event = match frames.recv().await {
            Ok(bytes) => match SyncMessage::decode(&bytes) {
                Ok(msg) => ChannelEvent::from_frame(msg, peer_id),
                Err(e) => {
                    log::warn!("Dropping undecodable frame on {doc}: {e}");
                    None
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Subscriber {peer_id} lagged by {n} frames on {doc}");
                if let Some(group) = hub.broadcast_group(&doc).await {
                    group.record_lag(n);
                }
                // Skipped snapshots are superseded by the current one
                hub.snapshot(&doc)
                    .await
                    .and_then(|msg| DocumentSnapshot::from_message(&msg).ok())
                    .map(ChannelEvent::Snapshot)
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = events.send(ChannelEvent::Closed).await;
                return;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                // Subscription dropped
                hub.leave(&doc, &peer_id).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_core::{RoomCode, RoomState};

    fn room_key(code: &str) -> DocumentKey {
        DocumentKey::room(&RoomCode::parse(code).unwrap())
    }

    fn room_doc(in_combat: bool) -> Vec<u8> {
        serde_json::to_vec(&RoomState {
            in_combat,
            ..RoomState::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_returns_initial_snapshot() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut channel = LocalChannel::new(hub, PeerInfo::new("Alice"));
        let sub = channel.subscribe(&room_key("abcd")).await.unwrap();

        assert_eq!(sub.doc(), &room_key("abcd"));
        assert_eq!(sub.initial().version, 1);
        let state: RoomState = sub.initial().decode().unwrap();
        assert!(state.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_publish_echo_carries_clock() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut channel = LocalChannel::new(hub, PeerInfo::new("Alice"));
        let doc = room_key("abcd");
        let mut sub = channel.subscribe(&doc).await.unwrap();

        let c1 = channel.publish(&doc, room_doc(true), None).await.unwrap();
        let c2 = channel.publish(&doc, room_doc(false), None).await.unwrap();
        assert_eq!((c1, c2), (1, 2));

        let ChannelEvent::Snapshot(first) = sub.next_event().await.unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(first.author, channel.peer_info().peer_id);
        assert_eq!(first.clock, 1);
        assert_eq!(first.version, 2);

        let ChannelEvent::Snapshot(second) = sub.next_event().await.unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(second.clock, 2);
        assert!(!second.decode::<RoomState>().unwrap().in_combat);
    }

    #[tokio::test]
    async fn test_roster_events_skip_self() {
        let hub = Arc::new(DocumentHub::in_memory());
        let doc = room_key("abcd");
        let mut alice = LocalChannel::new(hub.clone(), PeerInfo::new("Alice"));
        let mut bob = LocalChannel::new(hub.clone(), PeerInfo::new("Bob"));

        let mut a_sub = alice.subscribe(&doc).await.unwrap();
        let b_sub = bob.subscribe(&doc).await.unwrap();
        assert_eq!(b_sub.peers().len(), 1);
        assert_eq!(b_sub.peers()[0].name, "Alice");

        match a_sub.next_event().await.unwrap() {
            ChannelEvent::PeerJoined(info) => assert_eq!(info.name, "Bob"),
            other => panic!("expected PeerJoined, got {other:?}"),
        }

        bob.unsubscribe(&doc).await.unwrap();
        assert_eq!(
            a_sub.next_event().await.unwrap(),
            ChannelEvent::PeerLeft(bob.peer_info().peer_id)
        );
    }

    #[tokio::test]
    async fn test_rejected_publish_is_an_error() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut channel = LocalChannel::new(hub, PeerInfo::new("Alice"));
        let doc = room_key("abcd");
        let _sub = channel.subscribe(&doc).await.unwrap();

        let err = channel.publish(&doc, b"{{".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));

        let err = channel.publish(&doc, room_doc(true), Some(5)).await.unwrap_err();
        match err {
            SyncError::Rejected { reason } => assert!(reason.contains("version conflict")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_key() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut channel = LocalChannel::new(hub, PeerInfo::new("Alice"));
        assert!(matches!(
            channel.unsubscribe(&room_key("nope")).await,
            Err(SyncError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = Arc::new(DocumentHub::in_memory());
        let doc = room_key("abcd");
        let mut channel = LocalChannel::new(hub.clone(), PeerInfo::new("Alice"));
        let mut sub = channel.subscribe(&doc).await.unwrap();
        assert!(channel.is_subscribed(&doc));

        channel.unsubscribe(&doc).await.unwrap();
        assert!(!channel.is_subscribed(&doc));
        assert_eq!(sub.next_event().await, Some(ChannelEvent::Closed));
        assert_eq!(sub.next_event().await, None);
        assert!(hub.peers(&doc).await.is_empty());
    }

    #[test]
    fn test_event_from_frame() {
        let own = Uuid::new_v4();
        let doc = room_key("abcd");

        let own_join = SyncMessage::peer_joined(&PeerInfo::with_id(own, "Me"), doc.clone());
        assert_eq!(ChannelEvent::from_frame(own_join, own), None);

        let own_snapshot = SyncMessage::snapshot(own, doc.clone(), 4, 9, b"{}".to_vec());
        assert!(matches!(
            ChannelEvent::from_frame(own_snapshot, own),
            Some(ChannelEvent::Snapshot(DocumentSnapshot { clock: 4, version: 9, .. }))
        ));

        let rejected = SyncMessage::rejected(own, doc, 3, "version conflict");
        assert_eq!(
            ChannelEvent::from_frame(rejected, own),
            Some(ChannelEvent::Rejected {
                clock: 3,
                reason: "version conflict".into()
            })
        );
    }
}
