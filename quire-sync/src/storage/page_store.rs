//! RocksDB-backed persistent page store.
//!
//! Column families:
//! - `content`: Page content snapshots (bincode, LZ4 compressed)
//! - `metadata`: Page metadata (bincode: owner, version, sizes, timestamps)
//!
//! Both families are keyed by the 16 raw bytes of the page id. A content write
//! and its metadata update always land in one atomic `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use quire_core::{Content, PageId, Timestamp, UserId};

use crate::gateway::{ContentStore, GatewayError, PageWrite};

const CF_CONTENT: &str = "content";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CONTENT, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Page metadata stored alongside content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_id: PageId,
    /// Only the owner may read or write the page
    pub owner: UserId,
    /// Number of accepted content writes
    pub version: u64,
    /// Encoded content size in bytes
    pub content_size: u64,
    /// Stored (compressed) content size in bytes
    pub compressed_size: u64,
    pub created_at: Timestamp,
    /// Strictly increasing across writes
    pub updated_at: Timestamp,
}

impl PageMetadata {
    fn new(page_id: PageId, owner: UserId) -> Self {
        let now = Timestamp::now();
        Self {
            page_id,
            owner,
            version: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Page not registered
    NotFound(PageId),
    /// Actor does not own the page
    Unauthorized { actor: UserId },
    /// Content rejected before writing
    Validation(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Page not found: {id}"),
            StoreError::Unauthorized { actor } => write!(f, "User {actor} does not own this page"),
            StoreError::Validation(e) => write!(f, "Invalid content: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            StoreError::Unauthorized { .. } => GatewayError::Unauthorized,
            StoreError::Validation(reason) => GatewayError::Validation(reason),
            StoreError::DatabaseError(_) => GatewayError::Network(e.to_string()),
            StoreError::SerializationError(_)
            | StoreError::DeserializationError(_)
            | StoreError::CompressionError(_) => GatewayError::Validation(e.to_string()),
        }
    }
}

/// RocksDB-backed page store.
pub struct PageStore {
    /// RocksDB instance (single-threaded mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Held across every metadata read-modify-write
    write_lock: Mutex<()>,
}

impl PageStore {
    /// Open the page store at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened page store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        match name {
            // Values are LZ4 compressed before they reach RocksDB.
            CF_CONTENT => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => opts.set_compression_type(DBCompressionType::Lz4),
            _ => {}
        }

        opts
    }

    /// Create an empty (null content) page owned by `owner`.
    ///
    /// Registering an existing page again is a no-op for its owner.
    pub fn register_page(&self, page_id: PageId, owner: UserId) -> Result<PageMetadata, StoreError> {
        let _guard = self.lock_writes();
        match self.load_metadata(page_id) {
            Ok(meta) if meta.owner == owner => return Ok(meta),
            Ok(_) => return Err(StoreError::Unauthorized { actor: owner }),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut meta = PageMetadata::new(page_id, owner);
        self.write_batch(&mut meta, &Content::null())?;
        log::debug!("Registered page {page_id} for {owner}");
        Ok(meta)
    }

    /// Replace the content of a page.
    pub fn write_content(&self, actor: UserId, page_id: PageId, content: &Content) -> Result<PageMetadata, StoreError> {
        content.validate().map_err(StoreError::Validation)?;
        let _guard = self.lock_writes();
        let mut meta = self.load_metadata(page_id)?;
        if meta.owner != actor {
            return Err(StoreError::Unauthorized { actor });
        }

        meta.version += 1;
        meta.updated_at = Timestamp::after(meta.updated_at);
        self.write_batch(&mut meta, content)?;
        Ok(meta)
    }

    /// Encode, compress and atomically store content plus metadata.
    fn write_batch(&self, meta: &mut PageMetadata, content: &Content) -> Result<(), StoreError> {
        let cf_content = self.cf(CF_CONTENT)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(content, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        meta.content_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;

        let key = meta.page_id.as_uuid().as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_content, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load the content of a page (LZ4 decompressed).
    pub fn load_content(&self, page_id: PageId) -> Result<Content, StoreError> {
        let cf = self.cf(CF_CONTENT)?;
        let key = page_id.as_uuid().as_bytes().to_vec();

        let Some(compressed) = self.db.get_cf(&cf, &key)? else {
            return Err(StoreError::NotFound(page_id));
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (content, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(content)
    }

    pub fn load_metadata(&self, page_id: PageId) -> Result<PageMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let key = page_id.as_uuid().as_bytes().to_vec();

        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => PageMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(page_id)),
        }
    }

    pub fn page_exists(&self, page_id: PageId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, page_id.as_uuid().as_bytes())?.is_some())
    }

    /// List all page ids in the store.
    pub fn list_pages(&self) -> Result<Vec<PageId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut page_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid page key".into()))?;
            page_ids.push(PageId::from(uuid::Uuid::from_bytes(bytes)));
        }

        Ok(page_ids)
    }

    /// Delete a page's content and metadata.
    pub fn delete_page(&self, actor: UserId, page_id: PageId) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        let meta = self.load_metadata(page_id)?;
        if meta.owner != actor {
            return Err(StoreError::Unauthorized { actor });
        }

        let key = page_id.as_uuid().as_bytes().to_vec();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_CONTENT)?, &key);
        batch.delete_cf(&self.cf(CF_METADATA)?, &key);
        self.db.write(batch)?;
        log::debug!("Deleted page {page_id}");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl ContentStore for PageStore {
    fn write_content(
        &self,
        actor: UserId,
        page_id: PageId,
        content: Content,
    ) -> impl Future<Output = Result<PageWrite, GatewayError>> + Send {
        let result = PageStore::write_content(self, actor, page_id, &content)
            .map(|meta| PageWrite {
                page_id,
                content,
                updated_at: meta.updated_at,
            })
            .map_err(GatewayError::from);
        std::future::ready(result)
    }

    fn read_content(
        &self,
        actor: UserId,
        page_id: PageId,
    ) -> impl Future<Output = Result<Content, GatewayError>> + Send {
        let result = self.load_metadata(page_id).and_then(|meta| {
            if meta.owner == actor {
                self.load_content(page_id)
            } else {
                Err(StoreError::Unauthorized { actor })
            }
        });
        std::future::ready(result.map_err(GatewayError::from))
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
