//! Server-side fan-out of page updates to every subscriber of a topic.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to `capacity`
//! frames; a subscriber that falls further behind loses the overflow, which
//! is the delivery contract of the channel (best effort, no replay).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use quire_core::PageId;

use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded frame plus the client that published it.
///
/// Forwarders compare `origin` against their own client so the publisher
/// never receives its own update back.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Lock-free counters, read via [`BroadcastGroup::stats`].
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

/// A broadcast group for a single page topic.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Outbound>,

    /// Clients currently subscribed to this topic
    subscribers: RwLock<HashSet<Uuid>>,

    /// Channel capacity (frames buffered per receiver)
    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a subscriber and return its receiver.
    ///
    /// Subscribing twice replaces nothing; the caller gets a fresh receiver.
    pub async fn add_subscriber(&self, client_id: Uuid) -> broadcast::Receiver<Outbound> {
        self.subscribers.write().await.insert(client_id);
        self.sender.subscribe()
    }

    /// Remove a subscriber. Returns whether it was present.
    pub async fn remove_subscriber(&self, client_id: &Uuid) -> bool {
        self.subscribers.write().await.remove(client_id)
    }

    /// Encode and publish a message to every receiver.
    ///
    /// Filtering of the publisher is the forwarder's job. Returns the number
    /// of receivers the frame was queued for (zero subscribers is fine).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Outbound {
            origin: msg.origin,
            bytes: Arc::new(encoded),
        }))
    }

    /// Publish a pre-encoded frame (zero-copy fast path).
    pub fn broadcast_raw(&self, frame: Outbound) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, client_id: &Uuid) -> bool {
        self.subscribers.read().await.contains(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    TopicFull { limit: usize },
}

/// Room manager: maps page ids to broadcast groups.
///
/// Membership changes happen under the room-table write lock so a topic is
/// never removed between a lookup and the join that follows it.
pub struct RoomManager {
    rooms: RwLock<HashMap<PageId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
    max_subscribers: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_subscribers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_subscribers,
        }
    }

    /// Subscribe `client_id` to `page_id`, creating the topic on first use.
    pub async fn join(
        &self,
        page_id: PageId,
        client_id: Uuid,
    ) -> Result<(Arc<BroadcastGroup>, broadcast::Receiver<Outbound>), JoinError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(page_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();

        if !room.has_subscriber(&client_id).await
            && room.subscriber_count().await >= self.max_subscribers
        {
            return Err(JoinError::TopicFull {
                limit: self.max_subscribers,
            });
        }

        let rx = room.add_subscriber(client_id).await;
        Ok((room, rx))
    }

    /// Unsubscribe `client_id`; the topic is dropped once it has no subscribers.
    ///
    /// Returns `true` if the topic was removed.
    pub async fn leave(&self, page_id: PageId, client_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&page_id).cloned() else {
            return false;
        };
        room.remove_subscriber(client_id).await;
        if room.subscriber_count().await == 0 {
            rooms.remove(&page_id);
            return true;
        }
        false
    }

    /// Look up an existing topic. Publishing never creates one.
    pub async fn get(&self, page_id: &PageId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(page_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_pages(&self) -> Vec<PageId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
