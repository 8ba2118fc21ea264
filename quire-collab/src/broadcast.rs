//! Per-document fan-out.
//!
//! One tokio broadcast channel per room. A relayed message is encoded once
//! and shared as `Arc<Vec<u8>>`; each connection filters out its own echoes.
//! A receiver that falls more than `capacity` messages behind gets `Lagged`
//! and must resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Frames tagged with the peer that caused them, so receivers can skip
/// their own echoes without decoding.
pub type Frame = (Uuid, Arc<Vec<u8>>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Sends that found no subscriber.
    pub messages_unrouted: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_unrouted: AtomicU64,
}

/// Fan-out for one document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    max_peers: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow receiver may lag before it
    /// starts losing them.
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Admit a peer. `None` when the room is full.
    pub async fn add_peer(&self, info: PeerInfo) -> Option<broadcast::Receiver<Frame>> {
        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_peers && !peers.contains_key(&info.peer_id) {
            log::warn!("Room full ({} peers), rejecting {}", peers.len(), info.peer_id);
            return None;
        }
        peers.insert(info.peer_id, info);
        Some(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and fan out. Returns how many receivers got it,
    /// the sender's own receiver included.
    pub fn relay(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.relay_raw(msg.peer_id, encoded))
    }

    /// Fan out pre-encoded bytes on behalf of `origin`.
    pub fn relay_raw(&self, origin: Uuid, encoded: Arc<Vec<u8>>) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send((origin, encoded)) {
            Ok(count) => count,
            Err(_) => {
                self.stats.messages_unrouted.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_unrouted: self.stats.messages_unrouted.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
