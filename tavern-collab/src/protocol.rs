//! Binary frame protocol for whole-document replication.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc          │ clock    │ version  │ payload  │
//! │ 1 byte   │ 16 bytes  │ kind + key   │ varint   │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `payload` of `Publish` and `Snapshot` frames is the full JSON document.
//! `clock` is the sender's publish sequence; `version` is the hub's commit
//! counter for the document (for `Publish`, the expected version, 0 = any).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use tavern_core::{PlayerName, RoomCode};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Subscribe to a document (creates it with defaults if absent)
    Join = 1,
    /// Unsubscribe from a document
    Leave = 2,
    /// Replace the whole document
    Publish = 3,
    /// Full document state after a commit
    Snapshot = 4,
    /// A publish or join was refused
    Rejected = 5,
    /// Peer joined notification
    PeerJoined = 6,
    /// Peer left notification
    PeerLeft = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Which family of documents a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Shared room state, keyed by room code
    Room,
    /// Per-player character storage, keyed by player name
    Player,
}

/// Address of one replicated document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    pub kind: DocumentKind,
    pub key: String,
}

impl DocumentKey {
    pub fn room(code: &RoomCode) -> Self {
        Self {
            kind: DocumentKind::Room,
            key: code.as_str().to_string(),
        }
    }

    pub fn player(name: &PlayerName) -> Self {
        Self {
            kind: DocumentKind::Player,
            key: name.as_str().to_string(),
        }
    }

    /// Placeholder for frames not addressed to a document.
    pub fn nil() -> Self {
        Self {
            kind: DocumentKind::Room,
            key: String::new(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DocumentKind::Room => "room",
            DocumentKind::Player => "player",
        };
        write!(f, "{kind}/{}", self.key)
    }
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for roster rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Stable color from peer_id hash
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc: DocumentKey,
    pub clock: u64,
    pub version: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc: DocumentKey) -> Self {
        Self {
            msg_type,
            peer_id,
            doc,
            clock: 0,
            version: 0,
            payload: Vec::new(),
        }
    }

    /// Subscribe to `doc`, carrying the joining peer's info.
    pub fn join(info: &PeerInfo, doc: DocumentKey) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            payload,
            ..Self::new(MessageType::Join, info.peer_id, doc)
        }
    }

    pub fn leave(peer_id: Uuid, doc: DocumentKey) -> Self {
        Self::new(MessageType::Leave, peer_id, doc)
    }

    /// Replace `doc` with `document`. `expected_version` of `None` always wins.
    pub fn publish(
        peer_id: Uuid,
        doc: DocumentKey,
        clock: u64,
        expected_version: Option<u64>,
        document: Vec<u8>,
    ) -> Self {
        Self {
            clock,
            version: expected_version.unwrap_or(0),
            payload: document,
            ..Self::new(MessageType::Publish, peer_id, doc)
        }
    }

    /// Committed document state. `author`/`clock` identify the winning publish.
    pub fn snapshot(author: Uuid, doc: DocumentKey, clock: u64, version: u64, document: Vec<u8>) -> Self {
        Self {
            clock,
            version,
            payload: document,
            ..Self::new(MessageType::Snapshot, author, doc)
        }
    }

    pub fn rejected(peer_id: Uuid, doc: DocumentKey, clock: u64, reason: &str) -> Self {
        Self {
            clock,
            payload: reason.as_bytes().to_vec(),
            ..Self::new(MessageType::Rejected, peer_id, doc)
        }
    }

    pub fn peer_joined(info: &PeerInfo, doc: DocumentKey) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            payload,
            ..Self::new(MessageType::PeerJoined, info.peer_id, doc)
        }
    }

    pub fn peer_left(peer_id: Uuid, doc: DocumentKey) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, DocumentKey::nil())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, DocumentKey::nil())
    }

    /// Expected version carried by a `Publish` frame.
    pub fn expected_version(&self) -> Option<u64> {
        (self.msg_type == MessageType::Publish && self.version > 0).then_some(self.version)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse peer info payload of `Join` / `PeerJoined`.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Join | MessageType::PeerJoined) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    /// Reason text of a `Rejected` frame.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Rejected {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(code: &str) -> DocumentKey {
        DocumentKey::room(&RoomCode::parse(code).unwrap())
    }

    #[test]
    fn test_publish_roundtrip() {
        let peer = Uuid::new_v4();
        let doc = br#"{"inCombat":true}"#.to_vec();

        let msg = SyncMessage::publish(peer, room("abcd"), 42, None, doc.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Publish);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc, room("abcd"));
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.expected_version(), None);
        assert_eq!(decoded.payload, doc);
    }

    #[test]
    fn test_publish_expected_version() {
        let msg = SyncMessage::publish(Uuid::new_v4(), room("x"), 1, Some(7), Vec::new());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.expected_version(), Some(7));
    }

    #[test]
    fn test_snapshot_carries_author_and_version() {
        let author = Uuid::new_v4();
        let msg = SyncMessage::snapshot(author, room("abcd"), 3, 12, b"{}".to_vec());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Snapshot);
        assert_eq!(decoded.peer_id, author);
        assert_eq!(decoded.clock, 3);
        assert_eq!(decoded.version, 12);
        assert_eq!(decoded.expected_version(), None);
    }

    #[test]
    fn test_join_carries_peer_info() {
        let info = PeerInfo::new("Mira");
        let msg = SyncMessage::join(&info, room("abcd"));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let parsed = decoded.peer_info().unwrap();
        assert_eq!(parsed.name, "Mira");
        assert_eq!(parsed.peer_id, info.peer_id);
    }

    #[test]
    fn test_rejected_reason() {
        let msg = SyncMessage::rejected(Uuid::new_v4(), room("abcd"), 5, "version conflict");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.reason().unwrap(), "version conflict");
        assert_eq!(decoded.clock, 5);
    }

    #[test]
    fn test_document_key_display() {
        assert_eq!(room(" ABCD ").to_string(), "room/abcd");
        let player = DocumentKey::player(&PlayerName::parse("Bo").unwrap());
        assert_eq!(player.to_string(), "player/Bo");
        assert!(DocumentKey::nil().is_nil());
    }

    #[test]
    fn test_peer_info_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let info1 = PeerInfo::with_id(id, "Test");
        let info2 = PeerInfo::with_id(id, "Test");
        assert_eq!(info1.color, info2.color);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.peer_info().is_err());
        assert!(msg.reason().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Publish as u8, 3);
        assert_eq!(MessageType::Snapshot as u8, 4);
        assert_eq!(MessageType::Pong as u8, 9);
    }
}
