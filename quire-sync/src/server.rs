//! WebSocket relay with topic-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                  ┌── forwarder ──► Client B
//!            ├── RoomManager ───┤
//! Client B ──┘   (page_id)      └── forwarder ──► Client C
//! ```
//!
//! The relay stores nothing. It accepts `Update` frames, re-stamps them with
//! the sending connection's client id and fans them out to every other
//! subscriber of the page. Each subscription gets its own forwarder task
//! reading from the topic's broadcast channel, so one slow client only
//! loses its own overflow.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use quire_core::PageId;

use crate::broadcast::{BroadcastGroup, JoinError, Outbound, RoomManager};
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per page topic
    pub max_subscribers_per_topic: usize,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds; three silent intervals drop a client
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscribers_per_topic: 1000,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { key, value } => write!(f, "Invalid value for {key}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

impl ServerConfig {
    /// Defaults overridden by `QUIRE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("QUIRE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(value) = lookup("QUIRE_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse_positive("QUIRE_BROADCAST_CAPACITY", &value)?;
        }
        if let Some(value) = lookup("QUIRE_MAX_SUBSCRIBERS") {
            config.max_subscribers_per_topic = parse_positive("QUIRE_MAX_SUBSCRIBERS", &value)?;
        }
        if let Some(value) = lookup("QUIRE_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse_positive("QUIRE_HEARTBEAT_SECS", &value)?;
        }
        Ok(config)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Updates accepted and fanned out
    pub messages_relayed: u64,
    /// Frames lost by lagging subscribers
    pub messages_dropped: u64,
    pub active_topics: usize,
}

struct Relay {
    config: ServerConfig,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
    /// Closes every open connection when signalled
    kick: broadcast::Sender<()>,
}

/// The relay server.
pub struct SyncServer {
    relay: Arc<Relay>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity.max(1), config.max_subscribers_per_topic);
        let (kick, _) = broadcast::channel(1);
        Self {
            relay: Arc::new(Relay {
                config,
                rooms,
                stats: RwLock::new(ServerStats::default()),
                kick,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.relay.config.bind_addr
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.relay.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        self.relay.stats().await
    }

    /// Bind, then serve in the background.
    ///
    /// Binding happens before this returns, so the handle's address is ready
    /// for clients (useful with port 0).
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.relay.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Relay listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.relay.clone().serve(listener, shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            relay: self.relay,
            shutdown_tx,
            task,
        })
    }
}

impl Relay {
    async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_topics = self.rooms.room_count().await;
        stats
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        let relay = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay.handle_connection(stream, addr).await {
                                log::error!("Connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        let _ = self.kick.send(());
        log::info!("Relay stopped accepting connections");
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = ClientConnection {
            relay: self.clone(),
            addr,
            conn_id: Uuid::new_v4(),
            client_id: None,
            forwarders: HashMap::new(),
        };
        let result = conn.run(ws_stream).await;
        conn.cleanup().await;

        self.stats.write().await.active_connections -= 1;
        result
    }
}

/// Per-connection state on the relay.
struct ClientConnection {
    relay: Arc<Relay>,
    addr: SocketAddr,
    /// Topic membership key; a reconnecting client gets a fresh one
    conn_id: Uuid,
    /// Set by `Hello`
    client_id: Option<Uuid>,
    forwarders: HashMap<PageId, JoinHandle<()>>,
}

impl ClientConnection {
    async fn run(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(self.relay.config.broadcast_capacity.max(1));
        let mut kick_rx = self.relay.kick.subscribe();

        let interval = self.relay.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            if let Some(reply) = self.handle_frame(&data, &out_tx).await {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(_)) => last_seen = Instant::now(),
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                    }
                }

                frame = out_rx.recv() => {
                    if let Some(frame) = frame {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > interval * 3 {
                        log::warn!("Client {:?} at {} timed out", self.client_id, self.addr);
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }

                _ = kick_rx.recv() => {
                    log::info!("Closing connection from {}", self.addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Apply one inbound frame; returns a direct reply if one is due.
    async fn handle_frame(&mut self, data: &[u8], out_tx: &mpsc::Sender<Arc<Vec<u8>>>) -> Option<SyncMessage> {
        let mut msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", self.addr);
                return None;
            }
        };
        {
            let mut s = self.relay.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += data.len() as u64;
        }

        if msg.msg_type == MessageType::Hello {
            log::info!("Client {} connected from {}", msg.origin, self.addr);
            self.client_id = Some(msg.origin);
            return None;
        }
        if msg.msg_type == MessageType::Ping {
            return Some(SyncMessage::pong(self.client_id.unwrap_or_else(Uuid::nil)));
        }
        let Some(client_id) = self.client_id else {
            log::warn!("{:?} before Hello from {}, ignored", msg.msg_type, self.addr);
            return None;
        };

        match msg.msg_type {
            MessageType::Subscribe => self.subscribe(client_id, msg.page_id, out_tx).await,
            MessageType::Unsubscribe => self.unsubscribe(msg.page_id).await,
            MessageType::Update => {
                if let Err(e) = msg.content() {
                    log::warn!("Dropping malformed update from {client_id}: {e}");
                    return None;
                }
                // Publishing never creates a topic.
                let Some(room) = self.relay.rooms.get(&msg.page_id).await else {
                    log::trace!("No subscribers for page {}", msg.page_id);
                    return None;
                };
                msg.origin = client_id;
                match msg.encode() {
                    Ok(encoded) => {
                        let receivers = room.broadcast_raw(Outbound {
                            origin: client_id,
                            bytes: Arc::new(encoded),
                        });
                        self.relay.stats.write().await.messages_relayed += 1;
                        log::trace!("Relayed update for page {} to {receivers} receivers", msg.page_id);
                    }
                    Err(e) => log::error!("Failed to re-encode update: {e}"),
                }
            }
            MessageType::Pong => {}
            other => log::debug!("Unhandled message type: {other:?}"),
        }
        None
    }

    async fn subscribe(&mut self, client_id: Uuid, page_id: PageId, out_tx: &mpsc::Sender<Arc<Vec<u8>>>) {
        if self.forwarders.contains_key(&page_id) {
            return;
        }
        match self.relay.rooms.join(page_id, self.conn_id).await {
            Ok((room, rx)) => {
                let forwarder = spawn_forwarder(self.relay.clone(), page_id, client_id, room, rx, out_tx.clone());
                self.forwarders.insert(page_id, forwarder);
                log::debug!("Client {client_id} subscribed to page {page_id}");
            }
            Err(JoinError::TopicFull { limit }) => {
                log::warn!("Page {page_id} is full ({limit} subscribers), refused {client_id}");
            }
        }
    }

    async fn unsubscribe(&mut self, page_id: PageId) {
        if let Some(forwarder) = self.forwarders.remove(&page_id) {
            forwarder.abort();
            if self.relay.rooms.leave(page_id, &self.conn_id).await {
                log::debug!("Topic {page_id} removed (empty)");
            }
        }
    }

    async fn cleanup(&mut self) {
        let pages: Vec<PageId> = self.forwarders.keys().copied().collect();
        for page_id in pages {
            self.unsubscribe(page_id).await;
        }
        if let Some(client_id) = self.client_id {
            log::info!("Client {client_id} disconnected");
        }
    }
}

/// Copy frames from a topic to one connection, skipping the client's own.
fn spawn_forwarder(
    relay: Arc<Relay>,
    page_id: PageId,
    client_id: Uuid,
    room: Arc<BroadcastGroup>,
    mut rx: broadcast::Receiver<Outbound>,
    out_tx: mpsc::Sender<Arc<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if frame.origin == client_id {
                        continue;
                    }
                    if out_tx.send(frame.bytes).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    room.record_dropped(n);
                    relay.stats.write().await.messages_dropped += n;
                    log::warn!("Client {client_id} lagged by {n} updates on page {page_id}");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// A relay running in the background.
pub struct ServerHandle {
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub async fn stats(&self) -> ServerStats {
        self.relay.stats().await
    }

    /// Subscribers currently registered for `page_id`.
    pub async fn subscriber_count(&self, page_id: PageId) -> usize {
        match self.relay.rooms.get(&page_id).await {
            Some(room) => room.subscriber_count().await,
            None => 0,
        }
    }

    /// Close every open connection but keep accepting new ones.
    pub fn drop_connections(&self) {
        let closed = self.relay.kick.send(()).unwrap_or(0);
        log::info!("Dropping {closed} connections");
    }

    /// Stop accepting, close every connection and wait for the listener.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.task.await {
            log::error!("Relay task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_subscribers_per_topic, 1000);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_server_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("QUIRE_BIND_ADDR", "0.0.0.0:8080"),
            ("QUIRE_BROADCAST_CAPACITY", "512"),
            ("QUIRE_HEARTBEAT_SECS", " 15 "),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.broadcast_capacity, 512);
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert_eq!(config.max_subscribers_per_topic, 1000);
    }

    #[test]
    fn test_server_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(|key| {
            (key == "QUIRE_BROADCAST_CAPACITY").then(|| "0".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "QUIRE_BROADCAST_CAPACITY",
                value: "0".into()
            }
        );

        let err = ServerConfig::from_lookup(|key| (key == "QUIRE_MAX_SUBSCRIBERS").then(|| "many".to_string()));
        assert!(err.unwrap_err().to_string().contains("QUIRE_MAX_SUBSCRIBERS"));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.messages_relayed, 0);
        assert_eq!(stats.messages_dropped, 0);
        assert_eq!(stats.active_topics, 0);
        assert_eq!(server.room_manager().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let server = SyncServer::new(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        });
        let handle = server.start().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert!(handle.url().starts_with("ws://127.0.0.1:"));
        handle.drop_connections();
        handle.shutdown().await;
    }
}
