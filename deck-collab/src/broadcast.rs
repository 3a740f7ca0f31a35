//! Fan-out of text envelopes to the other connections of a room.
//!
//! Every presentation gets one tokio broadcast channel. Each connection
//! subscribes and skips the frames it sent itself; a peer that falls more
//! than `capacity` frames behind loses the oldest ones (reported as lag).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deck_core::{ParticipantId, Permission, PresentationId};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::Sender;

/// One WebSocket connection in a room. A participant with two open tabs
/// has two connections and two `PeerInfo`s.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub connection_id: Uuid,
    pub user_id: ParticipantId,
    pub username: String,
    pub permission: Permission,
}

impl PeerInfo {
    pub fn new(user_id: ParticipantId, username: impl Into<String>, permission: Permission) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id,
            username: username.into(),
            permission,
        }
    }

    pub fn sender(&self) -> Sender {
        Sender::new(self.user_id, self.username.clone())
    }
}

/// A frame queued for a room, tagged with the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub from: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayMessage>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection and subscribe it to the room.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<RelayMessage>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.connection_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(connection_id)
    }

    /// Queue `text` for every subscriber. Returns how many receivers it
    /// reached, including the sender's own (filtered on delivery).
    pub fn broadcast(&self, from: Uuid, text: String) -> usize {
        let count = self
            .sender
            .send(Arc::new(RelayMessage { from, text }))
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn record_lag(&self, skipped: u64) {
        self.stats.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Connected peers, ordered by participant id.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().await.values().cloned().collect();
        peers.sort_by_key(|p| p.user_id);
        peers
    }

    /// Whether `user_id` still has a connection in this room.
    pub async fn has_participant(&self, user_id: ParticipantId) -> bool {
        self.peers.read().await.values().any(|p| p.user_id == user_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Result of [`RoomManager::join`].
pub struct Joined {
    pub room: Arc<BroadcastGroup>,
    /// Connections present before this one, ordered by participant id.
    pub already_here: Vec<PeerInfo>,
    pub receiver: broadcast::Receiver<Arc<RelayMessage>>,
}

/// Result of [`RoomManager::leave`].
#[derive(Debug, Default, PartialEq)]
pub struct Departure {
    pub peer: Option<PeerInfo>,
    /// The participant still has another connection in the room.
    pub still_present: bool,
    pub room_closed: bool,
}

/// Maps presentations to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<PresentationId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Register `peer` in the room for `id`, creating it if needed.
    /// Returns the room, the peers that were already there and the new
    /// subscription. Lookup and registration happen under the map lock so a
    /// concurrent [`leave`](Self::leave) cannot close the room in between.
    pub async fn join(&self, id: PresentationId, peer: PeerInfo) -> Joined {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(id)
            .or_insert_with(|| {
                log::debug!("Opened room for presentation {id}");
                Arc::new(BroadcastGroup::new(self.default_capacity))
            })
            .clone();
        let already_here = room.peers().await;
        let receiver = room.add_peer(peer).await;
        Joined {
            room,
            already_here,
            receiver,
        }
    }

    /// Unregister a connection and close the room once it is empty.
    pub async fn leave(&self, id: PresentationId, connection_id: &Uuid) -> Departure {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&id).cloned() else {
            return Departure::default();
        };
        let peer = room.remove_peer(connection_id).await;
        let still_present = match &peer {
            Some(p) => room.has_participant(p.user_id).await,
            None => false,
        };
        let room_closed = room.peer_count().await == 0;
        if room_closed {
            rooms.remove(&id);
            log::debug!("Closed empty room for presentation {id}");
        }
        Departure {
            peer,
            still_present,
            room_closed,
        }
    }

    pub async fn room(&self, id: PresentationId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_presentations(&self) -> Vec<PresentationId> {
        let mut ids: Vec<PresentationId> = self.rooms.read().await.keys().copied().collect();
        ids.sort();
        ids
    }
}
