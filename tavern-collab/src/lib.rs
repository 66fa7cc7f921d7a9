//! # tavern-collab: Real-time room synchronization for Tavern
//!
//! Replicates whole `RoomState` and `PlayerDocument` values between players
//! with versioned last-writer-wins semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐                     ┌─────────────┐
//! │ Session     │                     │ SyncServer  │
//! │ (per user)  │                     │ (WebSocket) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │ ReplicationChannel                │
//!        ▼                                   ▼
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ DocumentHub │
//! │ LocalChannel│ ──── in-process ──► │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ DocumentStore │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Per-document fan-out with lag detection
//! - [`hub`]: Authoritative documents, versions and compare-and-swap
//! - [`channel`]: `ReplicationChannel` trait, subscriptions, in-process channel
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`session`]: Intents → room transitions → publishes
//! - [`storage`]: RocksDB persistence

pub mod protocol;
pub mod broadcast;
pub mod hub;
pub mod channel;
pub mod server;
pub mod client;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use protocol::{DocumentKey, DocumentKind, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use hub::{DocumentHub, HubConfig, HubError, Joined};
pub use channel::{
    ChannelEvent, DocumentSnapshot, LocalChannel, ReplicationChannel, Subscription, SyncError,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ConnectionState, SyncClient};
pub use session::{Alert, AlertKind, Intent, Session, SessionConfig, SessionError, SyncStatus};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError, StoredDocument};
