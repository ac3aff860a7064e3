//! Client-side view of the broadcast channel.
//!
//! A session only needs three things from the transport: its own origin
//! marker, a scoped subscription to one page, and, while a live connection
//! exists, a publisher. The publisher is handed out as `Option<Publisher>`:
//! `None` means there is currently nothing to publish to and the caller skips
//! the broadcast.
//!
//! [`LocalBus`] implements the same interface in-process, for embedding
//! several sessions in one runtime and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use quire_core::{Content, PageId};

use crate::protocol::{BroadcastMessage, SyncMessage};

/// Transport capability consumed by a page session.
pub trait BroadcastChannel: Send + Sync + 'static {
    /// Marker stamped on everything this client publishes.
    fn origin(&self) -> Uuid;

    /// Register interest in `page_id` until the returned guard is dropped.
    fn subscribe(&self, page_id: PageId) -> Subscription;

    /// Present only while a live connection exists.
    fn publisher(&self) -> Option<Publisher>;
}

/// Receiving end of a page subscription. Dropping it unsubscribes.
pub struct Subscription {
    page_id: PageId,
    rx: mpsc::Receiver<BroadcastMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        page_id: PageId,
        rx: mpsc::Receiver<BroadcastMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            page_id,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Next update for this page; `None` once the channel is gone for good.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("page_id", &self.page_id).finish()
    }
}

/// Fire-and-forget publishing handle bound to one live connection.
#[derive(Clone, Debug)]
pub struct Publisher {
    origin: Uuid,
    tx: mpsc::Sender<SyncMessage>,
}

impl Publisher {
    pub fn new(origin: Uuid, tx: mpsc::Sender<SyncMessage>) -> Self {
        Self { origin, tx }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Queue an update without waiting for anyone.
    ///
    /// Returns `false` if the frame was dropped (connection gone or its
    /// outgoing buffer full). Callers are not expected to act on it.
    pub fn publish(&self, page_id: PageId, content: &Content) -> bool {
        let msg = match SyncMessage::update(self.origin, page_id, content) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Could not encode update for page {page_id}: {e}");
                return false;
            }
        };
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropped update for page {page_id}: {e}");
                false
            }
        }
    }
}

struct LocalSubscriber {
    id: u64,
    origin: Uuid,
    online: Arc<AtomicBool>,
    tx: mpsc::Sender<BroadcastMessage>,
}

struct BusShared {
    topics: Mutex<HashMap<PageId, Vec<LocalSubscriber>>>,
    next_id: AtomicU64,
    subscriber_capacity: usize,
}

impl BusShared {
    fn deliver(&self, msg: SyncMessage) {
        let Ok(update) = msg.into_broadcast() else {
            return;
        };
        let Ok(topics) = self.topics.lock() else {
            return;
        };
        let Some(subscribers) = topics.get(&update.page_id) else {
            return;
        };
        for sub in subscribers {
            if sub.origin == update.origin || !sub.online.load(Ordering::Acquire) {
                continue;
            }
            if sub.tx.try_send(update.clone()).is_err() {
                log::debug!("Local subscriber {} lagging, update dropped", sub.id);
            }
        }
    }

    fn release(&self, page_id: PageId, id: u64) {
        if let Ok(mut topics) = self.topics.lock() {
            if let Some(subscribers) = topics.get_mut(&page_id) {
                subscribers.retain(|s| s.id != id);
                if subscribers.is_empty() {
                    topics.remove(&page_id);
                }
            }
        }
    }
}

/// In-process broadcast hub.
///
/// Must be created inside a tokio runtime: a router task forwards published
/// frames to subscribers of other clients.
#[derive(Clone)]
pub struct LocalBus {
    shared: Arc<BusShared>,
    router_tx: mpsc::Sender<SyncMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let shared = Arc::new(BusShared {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            subscriber_capacity: capacity,
        });
        let (router_tx, mut router_rx) = mpsc::channel::<SyncMessage>(capacity);
        let router = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = router_rx.recv().await {
                router.deliver(msg);
            }
        });
        Self { shared, router_tx }
    }

    /// Attach a new client with a fresh origin marker.
    pub fn client(&self) -> LocalClient {
        LocalClient {
            origin: Uuid::new_v4(),
            online: Arc::new(AtomicBool::new(true)),
            bus: self.clone(),
        }
    }

    /// Number of pages with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.shared.topics.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One client of a [`LocalBus`].
#[derive(Clone)]
pub struct LocalClient {
    origin: Uuid,
    online: Arc<AtomicBool>,
    bus: LocalBus,
}

impl LocalClient {
    /// Simulate losing or regaining the connection.
    ///
    /// While offline the client has no publisher and receives nothing;
    /// updates published meanwhile are not replayed.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

impl BroadcastChannel for LocalClient {
    fn origin(&self) -> Uuid {
        self.origin
    }

    fn subscribe(&self, page_id: PageId) -> Subscription {
        let shared = self.bus.shared.clone();
        let (tx, rx) = mpsc::channel(shared.subscriber_capacity);
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut topics) = shared.topics.lock() {
            topics.entry(page_id).or_default().push(LocalSubscriber {
                id,
                origin: self.origin,
                online: self.online.clone(),
                tx,
            });
        }
        Subscription::new(page_id, rx, move || shared.release(page_id, id))
    }

    fn publisher(&self) -> Option<Publisher> {
        self.is_online()
            .then(|| Publisher::new(self.origin, self.bus.router_tx.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_local_bus_delivers_to_other_clients() {
        let bus = LocalBus::new();
        let alice = bus.client();
        let bob = bus.client();
        let page = PageId::new();

        let mut bob_sub = bob.subscribe(page);
        let published = alice
            .publisher()
            .unwrap()
            .publish(page, &Content::new("[1]"));
        assert!(published);

        let update = timeout(Duration::from_secs(1), bob_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.page_id, page);
        assert_eq!(update.origin, alice.origin());
        assert_eq!(update.content, Content::new("[1]"));
    }

    #[tokio::test]
    async fn test_local_bus_never_echoes() {
        let bus = LocalBus::new();
        let alice = bus.client();
        let page = PageId::new();

        let mut own = alice.subscribe(page);
        alice.publisher().unwrap().publish(page, &Content::new("[]"));

        assert!(timeout(Duration::from_millis(100), own.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_with_no_subscribers_succeeds() {
        let bus = LocalBus::new();
        let alice = bus.client();
        assert!(alice.publisher().unwrap().publish(PageId::new(), &Content::null()));
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_topic() {
        let bus = LocalBus::new();
        let client = bus.client();
        let page = PageId::new();

        let sub = client.subscribe(page);
        assert_eq!(sub.page_id(), page);
        assert_eq!(bus.topic_count(), 1);
        drop(sub);
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_client_has_no_publisher() {
        let bus = LocalBus::new();
        let alice = bus.client();
        let bob = bus.client();
        let page = PageId::new();
        let mut bob_sub = bob.subscribe(page);

        alice.set_online(false);
        assert!(alice.publisher().is_none());

        bob.set_online(false);
        let carol = bus.client();
        carol.publisher().unwrap().publish(page, &Content::new("[]"));
        assert!(timeout(Duration::from_millis(100), bob_sub.recv()).await.is_err());

        // Nothing is replayed after coming back.
        bob.set_online(true);
        assert!(bob_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publisher_reports_dropped_frames() {
        let (tx, rx) = mpsc::channel(1);
        let publisher = Publisher::new(Uuid::new_v4(), tx);
        let page = PageId::new();

        assert!(publisher.publish(page, &Content::new("[]")));
        assert!(!publisher.publish(page, &Content::new("[]")));
        drop(rx);
        assert!(!publisher.publish(page, &Content::new("[]")));
    }
}
