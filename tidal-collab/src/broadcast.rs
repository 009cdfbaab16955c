//! Fan-out of applied deltas to every connection subscribed to a wave.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! frames. Frames are encoded once and shared; every frame remembers the
//! connection it came from and the wavelet it is about, so receivers can
//! skip their own deltas and apply their id filter without decoding.
//!
//! Performance target: 1,000 frames to 100 subscribers < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidal_core::{ParticipantId, WaveletId};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// A connection subscribed to a wave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub connection_id: Uuid,
    pub participant: ParticipantId,
}

/// One encoded server frame on its way to the subscribers of a wave.
#[derive(Debug)]
pub struct Broadcast {
    /// Connection whose submission produced this frame.
    pub origin: Uuid,
    pub wavelet_id: WaveletId,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read through `stats()`.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast channel of one wave.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Broadcast>>,
    peers: Arc<RwLock<HashMap<Uuid, Subscriber>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow subscriber may fall behind
    /// before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Subscribe a connection. Frames sent from now on reach it.
    pub async fn add_peer(&self, subscriber: Subscriber) -> broadcast::Receiver<Arc<Broadcast>> {
        let mut peers = self.peers.write().await;
        peers.insert(subscriber.connection_id, subscriber);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<Subscriber> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode `message` once and send it to every subscriber.
    ///
    /// Returns the number of receivers; filtering out `origin` is the
    /// receiver's job.
    pub fn broadcast(
        &self,
        origin: Uuid,
        wavelet_id: WaveletId,
        message: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = message.encode()?;
        Ok(self.broadcast_raw(Arc::new(Broadcast {
            origin,
            wavelet_id,
            frame,
        })))
    }

    /// Send a pre-built frame (zero-copy fast path).
    pub fn broadcast_raw(&self, broadcast: Arc<Broadcast>) -> usize {
        let count = self.sender.send(broadcast).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<Subscriber> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
