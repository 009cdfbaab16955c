//! Wave rooms: the wavelet containers of one wave plus its broadcast group.
//!
//! Each wave gets its own room so that submissions and fan-out are
//! isolated between waves. A room's containers sit behind one mutex; a
//! submission applies and broadcasts under that lock, so every subscriber
//! sees the deltas of a wavelet in the order they were applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tidal_core::{WaveId, WaveletId};
use tokio::sync::{Mutex, RwLock};

use crate::broadcast::BroadcastGroup;
use crate::container::{SubmitPolicy, WaveletContainer};

pub struct WaveRoom {
    wave_id: WaveId,
    pub broadcast: BroadcastGroup,
    pub wavelets: Mutex<BTreeMap<WaveletId, WaveletContainer>>,
    policy: SubmitPolicy,
    history_limit: Option<usize>,
}

impl WaveRoom {
    pub fn new(
        wave_id: WaveId,
        broadcast_capacity: usize,
        policy: SubmitPolicy,
        history_limit: Option<usize>,
    ) -> Self {
        Self {
            wave_id,
            broadcast: BroadcastGroup::new(broadcast_capacity),
            wavelets: Mutex::new(BTreeMap::new()),
            policy,
            history_limit,
        }
    }

    pub fn wave_id(&self) -> &WaveId {
        &self.wave_id
    }

    /// A fresh, empty container for `wavelet_id` with this room's settings.
    pub fn new_container(&self, wavelet_id: WaveletId) -> WaveletContainer {
        WaveletContainer::new(
            self.wave_id.clone(),
            wavelet_id,
            self.policy,
            self.history_limit,
        )
    }

    /// No subscribers and no wavelets.
    pub async fn is_empty(&self) -> bool {
        self.broadcast.peer_count().await == 0 && self.wavelets.lock().await.is_empty()
    }
}

/// Maps wave ids to rooms.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<WaveId, Arc<WaveRoom>>>>,
    broadcast_capacity: usize,
    policy: SubmitPolicy,
    history_limit: Option<usize>,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize, policy: SubmitPolicy, history_limit: Option<usize>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            broadcast_capacity,
            policy,
            history_limit,
        }
    }

    pub async fn get_or_create(&self, wave_id: &WaveId) -> Arc<WaveRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(wave_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(wave_id) {
            return room.clone();
        }

        let room = Arc::new(WaveRoom::new(
            wave_id.clone(),
            self.broadcast_capacity,
            self.policy,
            self.history_limit,
        ));
        rooms.insert(wave_id.clone(), room.clone());
        log::debug!("created room for {wave_id}");
        room
    }

    pub async fn get(&self, wave_id: &WaveId) -> Option<Arc<WaveRoom>> {
        self.rooms.read().await.get(wave_id).cloned()
    }

    /// Drop a room with no subscribers and no wavelets.
    pub async fn remove_if_empty(&self, wave_id: &WaveId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(wave_id) {
            if room.is_empty().await {
                rooms.remove(wave_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_waves(&self) -> Vec<WaveId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
