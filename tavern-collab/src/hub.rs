//! Authoritative document registry shared by every transport.
//!
//! ```text
//!  publish(doc, bytes) ──► validate ──► CAS check ──► store (RocksDB)
//!                                                        │
//!                                     version += 1 ◄─────┘
//!                                          │
//!                                          ▼
//!                              BroadcastGroup (Snapshot frame)
//!                                          │
//!                       ┌──────────────────┼──────────────────┐
//!                       ▼                  ▼                  ▼
//!                   author             subscriber         subscriber
//! ```
//!
//! Each document is replaced as a whole; the last committed publish wins.
//! Commits to one document are serialized by the registry lock and the
//! snapshot is broadcast before the lock is released, so every subscriber
//! observes snapshots in commit order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use tavern_core::model::now_millis;
use tavern_core::{PlayerDocument, RoomState};

use crate::broadcast::BroadcastGroup;
use crate::protocol::{DocumentKey, DocumentKind, PeerInfo, ProtocolError, SyncMessage};
use crate::storage::{DocumentStore, StoreError};

/// Hub errors. The `Display` text is what a `Rejected` frame carries.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid document: {0}")]
    Invalid(String),
    #[error("version conflict (expected {expected}, current {current})")]
    Conflict { expected: u64, current: u64 },
    #[error("room full: {doc} already has {max} peers")]
    RoomFull { doc: DocumentKey, max: usize },
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("document encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Maximum subscribers per document
    pub max_peers_per_room: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// What a subscriber gets back from [`DocumentHub::join`].
pub struct Joined {
    /// Current document as a `Snapshot` frame
    pub snapshot: SyncMessage,
    /// Committed frames from now on
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    /// Peers that were already subscribed
    pub peers: Vec<PeerInfo>,
}

/// One live document: current bytes, commit counter and its fan-out group.
struct DocumentRoom {
    document: Arc<Vec<u8>>,
    version: u64,
    author: Uuid,
    clock: u64,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(document: Vec<u8>, version: u64, capacity: usize) -> Self {
        Self {
            document: Arc::new(document),
            version,
            author: Uuid::nil(),
            clock: 0,
            broadcast: Arc::new(BroadcastGroup::new(capacity)),
        }
    }

    fn snapshot(&self, doc: &DocumentKey) -> SyncMessage {
        SyncMessage::snapshot(
            self.author,
            doc.clone(),
            self.clock,
            self.version,
            self.document.as_ref().clone(),
        )
    }
}

/// In-memory registry of documents, optionally written through to RocksDB.
pub struct DocumentHub {
    config: HubConfig,
    rooms: RwLock<HashMap<DocumentKey, DocumentRoom>>,
    store: Option<Arc<DocumentStore>>,
}

impl DocumentHub {
    pub fn new(config: HubConfig, store: Option<Arc<DocumentStore>>) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// In-memory hub with default limits.
    pub fn in_memory() -> Self {
        Self::new(HubConfig::default(), None)
    }

    /// Subscribe `peer` to `doc`, creating the document with defaults if it
    /// exists neither in memory nor in the store.
    pub async fn join(&self, doc: &DocumentKey, peer: PeerInfo) -> Result<Joined, HubError> {
        if doc.is_nil() {
            return Err(HubError::Invalid("empty document key".into()));
        }

        let mut rooms = self.rooms.write().await;
        if !rooms.contains_key(doc) {
            let room = self.load_or_create(doc)?;
            rooms.insert(doc.clone(), room);
        }
        let Some(room) = rooms.get(doc) else {
            return Err(HubError::Invalid(format!("{doc} vanished during join")));
        };

        let peer_id = peer.peer_id;
        let rejoin = room.broadcast.has_peer(&peer_id).await;
        if !rejoin && room.broadcast.peer_count().await >= self.config.max_peers_per_room {
            return Err(HubError::RoomFull {
                doc: doc.clone(),
                max: self.config.max_peers_per_room,
            });
        }

        let peers = room.broadcast.peers().await;
        // Announce before subscribing so the joiner does not see itself.
        room.broadcast.broadcast(&SyncMessage::peer_joined(&peer, doc.clone()))?;

        log::info!("Peer {} ({peer_id}) joined {doc} at v{}", peer.name, room.version);
        let receiver = room.broadcast.add_peer(peer).await;

        Ok(Joined {
            snapshot: room.snapshot(doc),
            receiver,
            peers: peers.into_iter().filter(|p| p.peer_id != peer_id).collect(),
        })
    }

    /// Unsubscribe `peer_id`. The document itself is never deleted; with a
    /// store attached an empty room is evicted from memory.
    pub async fn leave(&self, doc: &DocumentKey, peer_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc) else {
            return false;
        };

        let removed = room.broadcast.remove_peer(peer_id).await.is_some();
        if removed {
            if let Err(e) = room.broadcast.broadcast(&SyncMessage::peer_left(*peer_id, doc.clone())) {
                log::warn!("Failed to announce departure from {doc}: {e}");
            }
            log::info!("Peer {peer_id} left {doc}");
        }

        if self.store.is_some() && room.broadcast.peer_count().await == 0 {
            rooms.remove(doc);
            log::debug!("Evicted idle document {doc}");
        }
        removed
    }

    /// Replace `doc` with `payload` and broadcast the result to every
    /// subscriber, the author included. Returns the new version.
    pub async fn publish(
        &self,
        doc: &DocumentKey,
        author: Uuid,
        clock: u64,
        expected_version: Option<u64>,
        payload: Vec<u8>,
    ) -> Result<u64, HubError> {
        validate(doc.kind, &payload)?;

        let mut rooms = self.rooms.write().await;
        if !rooms.contains_key(doc) {
            let room = self.load_or_create(doc)?;
            rooms.insert(doc.clone(), room);
        }
        let Some(room) = rooms.get_mut(doc) else {
            return Err(HubError::Invalid(format!("{doc} vanished during publish")));
        };

        if let Some(expected) = expected_version {
            if expected != room.version {
                log::debug!(
                    "Rejected publish to {doc} from {author}: expected v{expected}, at v{}",
                    room.version
                );
                return Err(HubError::Conflict {
                    expected,
                    current: room.version,
                });
            }
        }

        let version = room.version + 1;
        if let Some(store) = &self.store {
            store.save_document(doc, version, &payload)?;
        }

        room.document = Arc::new(payload);
        room.version = version;
        room.author = author;
        room.clock = clock;
        let delivered = room.broadcast.broadcast(&room.snapshot(doc))?;
        log::debug!("Committed {doc} v{version} from {author} (clock {clock}) to {delivered} subscribers");

        if self.store.is_some() && room.broadcast.peer_count().await == 0 {
            rooms.remove(doc);
        }
        Ok(version)
    }

    /// Current state of a loaded document as a `Snapshot` frame.
    pub async fn snapshot(&self, doc: &DocumentKey) -> Option<SyncMessage> {
        self.rooms.read().await.get(doc).map(|room| room.snapshot(doc))
    }

    pub async fn version(&self, doc: &DocumentKey) -> Option<u64> {
        self.rooms.read().await.get(doc).map(|room| room.version)
    }

    pub async fn peers(&self, doc: &DocumentKey) -> Vec<PeerInfo> {
        let broadcast = self.rooms.read().await.get(doc).map(|room| room.broadcast.clone());
        match broadcast {
            Some(group) => group.peers().await,
            None => Vec::new(),
        }
    }

    /// Fan-out group of a loaded document, for lag accounting.
    pub async fn broadcast_group(&self, doc: &DocumentKey) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc).map(|room| room.broadcast.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    /// Preload every persisted document. Returns how many were loaded.
    pub async fn recover(&self) -> Result<usize, HubError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let docs = store.list_documents(None)?;
        let mut rooms = self.rooms.write().await;
        let mut recovered = 0;
        for doc in &docs {
            if rooms.contains_key(doc) {
                continue;
            }
            match store.load_document(doc) {
                Ok(stored) => {
                    let room = DocumentRoom::new(
                        stored.payload,
                        stored.version.max(1),
                        self.config.broadcast_capacity,
                    );
                    rooms.insert(doc.clone(), room);
                    recovered += 1;
                    log::info!("Recovered {doc} at v{} from storage", stored.version);
                }
                Err(e) => log::warn!("Skipping unreadable document {doc}: {e}"),
            }
        }

        log::info!("Recovery complete: {recovered}/{} documents restored", docs.len());
        Ok(recovered)
    }

    fn load_or_create(&self, doc: &DocumentKey) -> Result<DocumentRoom, HubError> {
        let capacity = self.config.broadcast_capacity;
        if let Some(store) = &self.store {
            match store.load_document(doc) {
                Ok(stored) => {
                    log::info!("Loaded {doc} v{} from storage", stored.version);
                    return Ok(DocumentRoom::new(stored.payload, stored.version.max(1), capacity));
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let payload = default_document(doc.kind)?;
        if let Some(store) = &self.store {
            store.save_document(doc, 1, &payload)?;
        }
        log::info!("Created {doc} with defaults");
        Ok(DocumentRoom::new(payload, 1, capacity))
    }
}

/// Fresh JSON document for `kind`.
pub fn default_document(kind: DocumentKind) -> Result<Vec<u8>, serde_json::Error> {
    match kind {
        DocumentKind::Room => serde_json::to_vec(&RoomState {
            last_update: now_millis(),
            ..RoomState::default()
        }),
        DocumentKind::Player => serde_json::to_vec(&PlayerDocument {
            characters: Vec::new(),
            last_update: now_millis(),
        }),
    }
}

/// Reject payloads that do not decode to the document schema.
fn validate(kind: DocumentKind, payload: &[u8]) -> Result<(), HubError> {
    match kind {
        DocumentKind::Room => {
            let state: RoomState = serde_json::from_slice(payload)
                .map_err(|e| HubError::Invalid(format!("not a room document: {e}")))?;
            if !state.is_consistent() {
                return Err(HubError::Invalid("token keys or turn index out of range".into()));
            }
        }
        DocumentKind::Player => {
            serde_json::from_slice::<PlayerDocument>(payload)
                .map_err(|e| HubError::Invalid(format!("not a player document: {e}")))?;
        }
    }
    Ok(())
}
