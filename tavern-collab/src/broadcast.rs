//! Fan-out of committed frames to every subscriber of one document.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` frames; a subscriber that falls further behind sees
//! `RecvError::Lagged` and must resynchronize from the latest snapshot.
//!
//! Delivery order per receiver equals send order, so a group that is only
//! sent to while the document lock is held delivers snapshots in commit
//! order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single document.
///
/// The sender receives its own frames too; filtering is the caller's job.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every receiver.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without registering a peer (observers, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DocumentKey;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let peer_id = peer.peer_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer_id).await);

        group.remove_peer(&peer_id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&peer_id).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_sender_too() {
        let group = BroadcastGroup::new(16);
        let alice = PeerInfo::new("Alice");
        let bob = PeerInfo::new("Bob");

        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(bob).await;

        let msg = SyncMessage::snapshot(alice.peer_id, DocumentKey::nil(), 1, 2, b"{}".to_vec());
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let a = SyncMessage::decode(&rx1.recv().await.unwrap()).unwrap();
        let b = SyncMessage::decode(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(a.version, 2);
        assert_eq!(b.peer_id, alice.peer_id);
    }

    #[tokio::test]
    async fn test_delivery_preserves_send_order() {
        let group = BroadcastGroup::new(64);
        let mut rx = group.subscribe();
        for v in 1..=20u64 {
            let msg = SyncMessage::snapshot(Uuid::nil(), DocumentKey::nil(), 0, v, Vec::new());
            group.broadcast(&msg).unwrap();
        }
        for v in 1..=20u64 {
            let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(msg.version, v);
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for _ in 0..5 {
            group.broadcast_raw(Arc::new(vec![1]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_lag(n);
                assert_eq!(group.stats().await.messages_lagged, n);
            }
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let peer = PeerInfo::new("Alice");
        let _rx = group.add_peer(peer.clone()).await;

        let msg = SyncMessage::ping(peer.peer_id);
        group.broadcast(&msg).unwrap();
        group.broadcast(&msg).unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_peer(PeerInfo::new("Alice")).await;
        let _rx2 = group.add_peer(PeerInfo::new("Bob")).await;

        let peers = group.peers().await;
        let names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(peers.len(), 2);
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
    }
}
