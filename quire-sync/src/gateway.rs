//! Persistence gateway: turns a coalesced edit into a durable write.
//!
//! The gateway never retries. A failed write is reported once, converted to a
//! user-facing [`Notice`], and superseded by the next successful save.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use quire_core::{Content, DataStoreError, MemoryStore, PageId, Timestamp, UserId};

/// A full content snapshot of one page, produced by the authoring session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub page_id: PageId,
    pub content: Content,
}

impl EditEvent {
    pub fn new(page_id: PageId, content: Content) -> Self {
        Self { page_id, content }
    }
}

/// An accepted write, echoing the stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWrite {
    pub page_id: PageId,
    pub content: Content,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("page {0} not found")]
    NotFound(PageId),
    #[error("not authorized to modify this page")]
    Unauthorized,
    #[error("rejected by the store: {0}")]
    Validation(String),
    #[error("store unreachable: {0}")]
    Network(String),
    #[error("no answer from the store within {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Network trouble and timeouts may succeed on a later save; the rest
    /// need the user to do something first.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<DataStoreError> for GatewayError {
    fn from(e: DataStoreError) -> Self {
        match e {
            DataStoreError::PageNotFound(id) => Self::NotFound(id),
            DataStoreError::Unauthorized { .. } => Self::Unauthorized,
            DataStoreError::Validation(reason) => Self::Validation(reason),
            DataStoreError::FolderNotFound(id) => Self::Validation(format!("folder {id} not found")),
            DataStoreError::Poisoned => Self::Network(e.to_string()),
        }
    }
}

/// Durable keyed storage for page content.
pub trait ContentStore: Send + Sync + 'static {
    fn write_content(
        &self,
        actor: UserId,
        page_id: PageId,
        content: Content,
    ) -> impl Future<Output = Result<PageWrite, GatewayError>> + Send;

    fn read_content(
        &self,
        actor: UserId,
        page_id: PageId,
    ) -> impl Future<Output = Result<Content, GatewayError>> + Send;
}

impl ContentStore for MemoryStore {
    fn write_content(
        &self,
        actor: UserId,
        page_id: PageId,
        content: Content,
    ) -> impl Future<Output = Result<PageWrite, GatewayError>> + Send {
        let result = MemoryStore::write_content(self, actor, page_id, content)
            .map(|page| PageWrite {
                page_id: page.id,
                content: page.content,
                updated_at: page.updated_at,
            })
            .map_err(GatewayError::from);
        std::future::ready(result)
    }

    fn read_content(
        &self,
        actor: UserId,
        page_id: PageId,
    ) -> impl Future<Output = Result<Content, GatewayError>> + Send {
        let result = self
            .get_page(page_id)
            .map_err(GatewayError::from)
            .and_then(|page| {
                if page.owner == actor {
                    Ok(page.content)
                } else {
                    Err(GatewayError::Unauthorized)
                }
            });
        std::future::ready(result)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound for one store request; exceeding it counts as a failure.
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Writes edits on behalf of one authenticated user.
pub struct PersistenceGateway<S> {
    store: Arc<S>,
    actor: UserId,
    config: GatewayConfig,
}

impl<S> Clone for PersistenceGateway<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            actor: self.actor,
            config: self.config.clone(),
        }
    }
}

impl<S: ContentStore> PersistenceGateway<S> {
    pub fn new(store: Arc<S>, actor: UserId) -> Self {
        Self::with_config(store, actor, GatewayConfig::default())
    }

    pub fn with_config(store: Arc<S>, actor: UserId, config: GatewayConfig) -> Self {
        Self { store, actor, config }
    }

    pub fn actor(&self) -> UserId {
        self.actor
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Durably store the snapshot carried by `edit`.
    pub async fn persist(&self, edit: EditEvent) -> Result<PageWrite, GatewayError> {
        let page_id = edit.page_id;
        let write = self.store.write_content(self.actor, page_id, edit.content);
        match tokio::time::timeout(self.config.request_timeout, write).await {
            Ok(Ok(accepted)) => {
                log::debug!("Persisted page {page_id} at {}", accepted.updated_at.as_millis());
                Ok(accepted)
            }
            Ok(Err(e)) => {
                log::warn!("Write for page {page_id} failed: {e}");
                Err(e)
            }
            Err(_) => {
                log::warn!("Write for page {page_id} timed out");
                Err(GatewayError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Read the durable content of a page.
    pub async fn load(&self, page_id: PageId) -> Result<Content, GatewayError> {
        let read = self.store.read_content(self.actor, page_id);
        tokio::time::timeout(self.config.request_timeout, read)
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.config.request_timeout)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Non-blocking message for the user about a failed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    /// Transient problems can simply be dismissed.
    pub dismissible: bool,
}

impl Notice {
    pub fn from_error(error: &GatewayError) -> Self {
        let (severity, message) = match error {
            GatewayError::Network(_) | GatewayError::Timeout(_) => (
                Severity::Warning,
                "Changes could not be saved right now. They will be saved with your next edit.".to_string(),
            ),
            GatewayError::Unauthorized => (
                Severity::Error,
                "You are no longer signed in. Sign in again to keep saving.".to_string(),
            ),
            GatewayError::NotFound(_) => (
                Severity::Error,
                "This page no longer exists. Reload to continue.".to_string(),
            ),
            GatewayError::Validation(reason) => {
                (Severity::Error, format!("The page could not be saved: {reason}"))
            }
        };
        Self {
            severity,
            message,
            dismissible: error.is_transient(),
        }
    }
}
