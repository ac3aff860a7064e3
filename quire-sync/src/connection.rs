//! Session connection manager: one WebSocket per client process.
//!
//! Provides:
//! - Connection lifecycle (connect, heartbeat, reconnect with backoff, shutdown)
//! - Page subscriptions multiplexed over the single connection
//! - A publisher capability that only exists while connected
//!
//! State machine:
//! ```text
//!              ┌──────────── backoff ────────────┐
//!              ▼                                 │
//! Disconnected ──► Connecting ──► Connected ──► Disconnected
//!        │                                       (error / close)
//!        └── shutdown() from any state ──► Closed
//! ```
//!
//! On every (re)connect the manager sends `Hello`, then `Subscribe` for every
//! page that currently has a local subscriber, and only then hands out
//! publishers. Updates published while disconnected are dropped, never
//! replayed.
//!
//! `Subscribe`/`Unsubscribe` travel on an unbounded control queue that the
//! connection drains before any update, so a publish burst can delay topic
//! changes but never lose them. Updates use a bounded queue and are dropped
//! when it is full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use quire_core::PageId;

use crate::channel::{BroadcastChannel, Publisher, Subscription};
use crate::protocol::{BroadcastMessage, MessageType, ProtocolError, SyncMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Explicit teardown; terminal.
    Closed,
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

#[derive(Debug)]
struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    fn new(config: BackoffConfig) -> Self {
        let next = config.initial;
        Self { config, next }
    }

    /// Current delay; the next one grows by `multiplier` (at least 1), capped at `max`.
    fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.config.max);
        self.next = delay
            .checked_mul(self.config.multiplier.max(1))
            .unwrap_or(self.config.max)
            .min(self.config.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.config.initial;
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub connect_timeout: Duration,
    /// How often a ping is sent on an idle connection
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead
    pub heartbeat_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Frames buffered towards the socket before publishes are dropped
    pub outgoing_capacity: usize,
    /// Updates buffered per subscription before they are dropped
    pub subscriber_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            backoff: BackoffConfig::default(),
            outgoing_capacity: 256,
            subscriber_capacity: 64,
        }
    }

    /// Short timeouts and backoff, for tests against a local relay.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(3),
            backoff: BackoffConfig {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(200),
                multiplier: 2,
            },
            ..Self::new(server_url)
        }
    }
}

struct LocalSubscriber {
    id: u64,
    tx: mpsc::Sender<BroadcastMessage>,
}

/// Outgoing queues of one live connection.
struct Link {
    control: mpsc::UnboundedSender<SyncMessage>,
    updates: mpsc::Sender<SyncMessage>,
}

impl Link {
    fn control(&self, msg: SyncMessage) {
        if self.control.send(msg).is_err() {
            log::debug!("Connection closing, control frame not sent");
        }
    }
}

/// Receiving ends of a [`Link`], owned by the connection task.
struct LinkQueues {
    control: mpsc::UnboundedReceiver<SyncMessage>,
    updates: mpsc::Receiver<SyncMessage>,
}

/// State shared between handles, subscriptions and the driver task.
///
/// Lock order: `topics` before `link`.
struct Shared {
    client_id: Uuid,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    topics: Mutex<HashMap<PageId, Vec<LocalSubscriber>>>,
    /// Outgoing queues of the live connection, if any
    link: Mutex<Option<Link>>,
    next_subscriber: AtomicU64,
    connects: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Connection {}: {previous:?} -> {state:?}", self.client_id);
        }
    }

    fn clear_link(&self) {
        lock(&self.link).take();
    }

    fn release(&self, page_id: PageId, id: u64) {
        let mut topics = lock(&self.topics);
        let Some(subscribers) = topics.get_mut(&page_id) else {
            return;
        };
        subscribers.retain(|s| s.id != id);
        if !subscribers.is_empty() {
            return;
        }
        topics.remove(&page_id);
        if let Some(link) = lock(&self.link).as_ref() {
            link.control(SyncMessage::unsubscribe(self.client_id, page_id));
        }
        log::debug!("Released subscription to page {page_id}");
    }

    /// Route an inbound frame to the local subscribers of its page.
    fn dispatch(&self, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode frame from relay: {e}");
                return;
            }
        };
        match msg.msg_type {
            MessageType::Update => {
                if msg.origin == self.client_id {
                    return;
                }
                let update = match msg.into_broadcast() {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("Malformed update from relay: {e}");
                        return;
                    }
                };
                let topics = lock(&self.topics);
                let Some(subscribers) = topics.get(&update.page_id) else {
                    log::trace!("Update for unsubscribed page {}", update.page_id);
                    return;
                };
                for subscriber in subscribers {
                    if subscriber.tx.try_send(update.clone()).is_err() {
                        log::debug!("Subscriber {} for page {} is full, update dropped", subscriber.id, update.page_id);
                    }
                }
            }
            MessageType::Pong | MessageType::Ping => {}
            other => log::debug!("Unexpected {other:?} from relay"),
        }
    }

    /// Open the outgoing queues, re-subscribe every live topic, publish the link.
    fn attach(&self) -> LinkQueues {
        let topics = lock(&self.topics);
        let mut link = lock(&self.link);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::channel(self.config.outgoing_capacity.max(1));
        let fresh = Link {
            control: control_tx,
            updates: updates_tx,
        };
        for page_id in topics.keys() {
            fresh.control(SyncMessage::subscribe(self.client_id, *page_id));
        }
        log::debug!("Re-subscribed {} pages", topics.len());
        *link = Some(fresh);
        LinkQueues {
            control: control_rx,
            updates: updates_rx,
        }
    }

    /// Run one established connection until it closes or fails.
    async fn run_connection(
        &self,
        ws: WsStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let hello = SyncMessage::hello(self.client_id).encode()?;
        ws_tx.send(Message::Binary(hello.into())).await?;

        let mut queues = self.attach();
        self.set_state(ConnectionState::Connected);
        self.connects.fetch_add(1, Ordering::Relaxed);

        let interval = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;

                control = queues.control.recv() => {
                    let Some(msg) = control else {
                        return Ok(());
                    };
                    ws_tx.send(Message::Binary(msg.encode()?.into())).await?;
                }

                outgoing = queues.updates.recv() => {
                    let Some(msg) = outgoing else {
                        return Ok(());
                    };
                    ws_tx.send(Message::Binary(msg.encode()?.into())).await?;
                }

                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            self.dispatch(&data);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_tx.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => last_seen = Instant::now(),
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.heartbeat_timeout {
                        return Err(Box::new(ProtocolError::Timeout));
                    }
                    let ping = SyncMessage::ping(self.client_id).encode()?;
                    ws_tx.send(Message::Binary(ping.into())).await?;
                }

                _ = shutdown_rx.changed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Driver task: connect, run, back off, repeat until shutdown.
async fn drive(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(shared.config.backoff.clone());
    let url = shared.config.server_url.clone();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let attempt = tokio::time::timeout(
            shared.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let outcome = tokio::select! {
            outcome = attempt => outcome,
            _ = shutdown_rx.changed() => break,
        };

        match outcome {
            Ok(Ok((ws, _))) => {
                log::info!("Connected to {url}");
                backoff.reset();
                match shared.run_connection(ws, &mut shutdown_rx).await {
                    Ok(()) => log::info!("Connection to {url} closed"),
                    Err(e) => log::warn!("Connection to {url} lost: {e}"),
                }
            }
            Ok(Err(e)) => log::warn!("Could not connect to {url}: {e}"),
            Err(_) => log::warn!("Timed out connecting to {url}"),
        }

        shared.clear_link();
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Disconnected);

        let delay = backoff.next_delay();
        log::debug!("Reconnecting to {url} in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    shared.clear_link();
    shared.set_state(ConnectionState::Closed);
    log::info!("Connection manager {} closed", shared.client_id);
}

/// Dropping the last manager handle stops the driver.
struct Lifecycle {
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the process-wide connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    lifecycle: Arc<Lifecycle>,
}

impl ConnectionManager {
    /// Start connecting in the background. Must be called inside a runtime.
    pub fn start(config: ConnectionConfig) -> Self {
        Self::start_with_id(Uuid::new_v4(), config)
    }

    pub fn start_with_id(client_id: Uuid, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client_id,
            config,
            state_tx,
            topics: Mutex::new(HashMap::new()),
            link: Mutex::new(None),
            next_subscriber: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        });

        let driver = tokio::spawn(drive(shared.clone(), shutdown_rx));
        Self {
            shared,
            lifecycle: Arc::new(Lifecycle {
                shutdown_tx,
                driver: Mutex::new(Some(driver)),
            }),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the manager reaches `target`.
    pub async fn wait_for(&self, target: ConnectionState) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Number of successful connections so far (1 + reconnects).
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Pages with at least one local subscriber.
    pub fn subscribed_pages(&self) -> Vec<PageId> {
        lock(&self.shared.topics).keys().copied().collect()
    }

    /// Subscribe to updates for `page_id` for as long as the guard lives.
    ///
    /// Works in any state: the relay learns about it now if connected,
    /// otherwise on the next connect.
    pub fn subscribe(&self, page_id: PageId) -> Subscription {
        let shared = &self.shared;
        let (tx, rx) = mpsc::channel(shared.config.subscriber_capacity);
        let id = shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            let mut topics = lock(&shared.topics);
            let subscribers = topics.entry(page_id).or_default();
            let first = subscribers.is_empty();
            subscribers.push(LocalSubscriber { id, tx });
            if first {
                if let Some(link) = lock(&shared.link).as_ref() {
                    link.control(SyncMessage::subscribe(shared.client_id, page_id));
                }
            }
        }

        let shared = self.shared.clone();
        Subscription::new(page_id, rx, move || shared.release(page_id, id))
    }

    /// Publishing handle for the current connection; `None` while offline.
    pub fn publisher(&self) -> Option<Publisher> {
        lock(&self.shared.link)
            .as_ref()
            .map(|link| Publisher::new(self.shared.client_id, link.updates.clone()))
    }

    /// Explicit teardown. The manager ends in [`ConnectionState::Closed`]
    /// and never reconnects.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown_tx.send_replace(true);
        let driver = lock(&self.lifecycle.driver).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                log::error!("Connection driver failed: {e}");
            }
        }
    }
}

impl BroadcastChannel for ConnectionManager {
    fn origin(&self) -> Uuid {
        self.client_id()
    }

    fn subscribe(&self, page_id: PageId) -> Subscription {
        ConnectionManager::subscribe(self, page_id)
    }

    fn publisher(&self) -> Option<Publisher> {
        ConnectionManager::publisher(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2,
        });
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_survives_extreme_settings() {
        let mut huge = Backoff::new(BackoffConfig {
            initial: Duration::from_secs(u64::MAX / 2),
            max: Duration::MAX,
            multiplier: 4,
        });
        assert_eq!(huge.next_delay(), Duration::from_secs(u64::MAX / 2));
        assert_eq!(huge.next_delay(), Duration::MAX);
        assert_eq!(huge.next_delay(), Duration::MAX);

        let mut flat = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 0,
        });
        assert_eq!(flat.next_delay(), Duration::from_millis(50));
        assert_eq!(flat.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("ws://localhost:9090");
        assert_eq!(config.server_url, "ws://localhost:9090");
        assert!(config.heartbeat_timeout > config.heartbeat_interval);

        let testing = ConnectionConfig::for_testing("ws://localhost:1");
        assert!(testing.backoff.initial < config.backoff.initial);
    }

    #[tokio::test]
    async fn test_offline_manager_behaviour() {
        // Nothing listens on port 9; the manager keeps retrying in the background.
        let manager = ConnectionManager::start(ConnectionConfig::for_testing("ws://127.0.0.1:9"));
        let page = PageId::new();

        assert!(manager.publisher().is_none());
        assert_ne!(manager.state(), ConnectionState::Connected);

        let sub = manager.subscribe(page);
        assert_eq!(manager.subscribed_pages(), vec![page]);
        drop(sub);
        assert!(manager.subscribed_pages().is_empty());

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.publisher().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_filters_echo_and_routes_by_page() {
        let manager = ConnectionManager::start(ConnectionConfig::for_testing("ws://127.0.0.1:9"));
        let page = PageId::new();
        let other = PageId::new();
        let mut sub = manager.subscribe(page);

        let own = SyncMessage::update(manager.client_id(), page, &quire_core::Content::new("[0]")).unwrap();
        manager.shared.dispatch(&own.encode().unwrap());
        assert!(sub.try_recv().is_none());

        let elsewhere = SyncMessage::update(Uuid::new_v4(), other, &quire_core::Content::new("[2]")).unwrap();
        manager.shared.dispatch(&elsewhere.encode().unwrap());
        assert!(sub.try_recv().is_none());

        let remote = SyncMessage::update(Uuid::new_v4(), page, &quire_core::Content::new("[1]")).unwrap();
        manager.shared.dispatch(&remote.encode().unwrap());
        let received = sub.try_recv().unwrap();
        assert_eq!(received.content, quire_core::Content::new("[1]"));

        manager.shared.dispatch(&[0xFF, 0x00]);
        manager.shutdown().await;
    }
}
