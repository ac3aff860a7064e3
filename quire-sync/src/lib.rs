//! # quire-sync: Real-time page sync for Quire
//!
//! Keeps every open view of a page converged on the latest saved snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  quiet period  ┌───────────────────┐   write   ┌───────────┐
//! │ PageSession │ ─────────────► │PersistenceGateway │ ────────► │ PageStore │
//! │ (per page)  │                └─────────┬─────────┘           └───────────┘
//! └──────┬──────┘                          │ saved
//!        │ subscribe                        ▼
//! ┌──────┴────────────┐   WebSocket   ┌─────────────┐
//! │ ConnectionManager │ ◄───────────► │ SyncServer  │──► other clients
//! │ (per process)     │  Binary Proto │ (relay)     │
//! └───────────────────┘               └─────────────┘
//! ```
//!
//! Saves happen first, broadcasts after; a client that receives an update
//! overwrites its local document with it (last writer wins).
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Topic-based fan-out with backpressure
//! - [`server`]: WebSocket relay
//! - [`connection`]: Client connection with reconnect and resubscribe
//! - [`channel`]: Transport capability seen by a session, plus an in-process bus
//! - [`debounce`]: Debounced change emitter
//! - [`gateway`]: Persistence gateway and user notices
//! - [`reconcile`]: Remote update policy
//! - [`session`]: Page session actor
//! - [`storage`]: RocksDB page store

pub mod protocol;
pub mod broadcast;
pub mod server;
pub mod connection;
pub mod channel;
pub mod debounce;
pub mod gateway;
pub mod reconcile;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use protocol::{BroadcastMessage, MessageType, ProtocolError, SyncMessage};
pub use broadcast::{BroadcastGroup, BroadcastStats, JoinError, Outbound, RoomManager};
pub use server::{ConfigError, ServerConfig, ServerHandle, ServerStats, SyncServer};
pub use connection::{BackoffConfig, ConnectionConfig, ConnectionManager, ConnectionState};
pub use channel::{BroadcastChannel, LocalBus, LocalClient, Publisher, Subscription};
pub use debounce::{Debouncer, DEFAULT_QUIET_PERIOD};
pub use gateway::{
    ContentStore, EditEvent, GatewayConfig, GatewayError, Notice, PageWrite,
    PersistenceGateway, Severity,
};
pub use reconcile::{EditorState, LastWriterWins, Reconciliation, ReconciliationPolicy};
pub use session::{PageSession, SessionConfig, SessionError, SessionEvent};
pub use storage::{PageMetadata, PageStore, StoreConfig, StoreError};
