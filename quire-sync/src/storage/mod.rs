//! Durable storage for page content.
//!
//! ```text
//! ┌──────────────────┐  ContentStore  ┌──────────────────────────────┐
//! │PersistenceGateway│ ─────────────► │ PageStore (RocksDB)          │
//! └──────────────────┘                │ CF "content":  LZ4 snapshots │
//!                                     │ CF "metadata": page metadata │
//!                                     └──────────────────────────────┘
//! ```

pub mod page_store;

pub use page_store::{PageMetadata, PageStore, StoreConfig, StoreError};
