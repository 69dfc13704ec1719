//! Room-scoped fan-out to N-1 peers.
//!
//! One tokio broadcast channel per room: every member gets an
//! independent receiver buffering up to `capacity` frames. The single
//! channel per room preserves a sender's frame order end to end; a
//! member that falls more than `capacity` frames behind starts dropping
//! (backpressure) and recovers via a full resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ParticipantInfo, ProtocolError, WireMessage};

/// Fan-out health counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub members: usize,
}

/// Counters kept in atomics so the send path never takes a lock.
struct AtomicChannelStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicChannelStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// The fan-out channel for one room.
///
/// Members share one broadcast channel; filtering a sender's own frames
/// back out is the receiving side's job (it knows its client id).
pub struct RoomChannel {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: Arc<RwLock<HashMap<Uuid, ParticipantInfo>>>,
    capacity: usize,
    stats: Arc<AtomicChannelStats>,
}

impl RoomChannel {
    /// `capacity` is the per-member frame buffer before a lagging member
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicChannelStats::new()),
        }
    }

    /// Add a member; returns their receiver for room traffic.
    pub async fn add_member(&self, info: ParticipantInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut members = self.members.write().await;
        members.insert(info.client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, client_id: &Uuid) -> Option<ParticipantInfo> {
        let mut members = self.members.write().await;
        members.remove(client_id)
    }

    /// Encode and fan a message out to every member. Returns the number
    /// of receivers it reached. Lock-free on the send path.
    pub fn send(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.send_raw(encoded))
    }

    /// Fan out pre-encoded bytes (zero-copy fast path).
    pub fn send_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a member's receiver skipped `n` frames. Called when
    /// a receiver reports lag, right before the resync kicks in.
    pub fn note_lagged(&self, n: u64) {
        self.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<ParticipantInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, client_id: &Uuid) -> bool {
        self.members.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> ChannelStats {
        let members = self.members.read().await;
        ChannelStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw subscription without membership (server-side plumbing).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Maps room ids to their fan-out channels. Rooms are created on first
/// join and torn down once the last member leaves — traffic never
/// crosses rooms.
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<RoomChannel>>>>,
    default_capacity: usize,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the channel for a room.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<RoomChannel> {
        // Fast path: read lock.
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(RoomChannel::new(self.default_capacity));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<RoomChannel>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Tear down a room with no members left. Returns whether it was
    /// removed.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if room.member_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
