//! Persistence integration tests.
//!
//! Verifies:
//! - Saves through the gateway land in RocksDB and survive a reopen
//! - A full session (debounce, save, broadcast) on top of the page store
//! - Failure classification for writes the store refuses

use std::sync::Arc;

use quire_core::{Content, PageId, UserId};
use quire_sync::channel::{BroadcastChannel, LocalBus};
use quire_sync::gateway::{EditEvent, GatewayError, Notice, PersistenceGateway, Severity};
use quire_sync::session::{PageSession, SessionConfig, SessionEvent};
use quire_sync::storage::{PageStore, StoreConfig};
use tempfile::tempdir;
use tokio::time::{timeout, Duration};

fn open_store(path: &std::path::Path) -> Arc<PageStore> {
    Arc::new(PageStore::open(StoreConfig::for_testing(path)).unwrap())
}

#[tokio::test]
async fn test_gateway_roundtrip_survives_reopen() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");
    let owner = UserId::new();
    let page = PageId::new();
    let content = Content::new(r#"[{"type":"todo","checked":false,"content":"ship it"}]"#);

    {
        let store = open_store(&db);
        store.register_page(page, owner).unwrap();
        let gateway = PersistenceGateway::new(store.clone(), owner);
        let accepted = gateway.persist(EditEvent::new(page, content.clone())).await.unwrap();
        assert_eq!(accepted.content, content);
        store.sync().unwrap();
    }

    let store = open_store(&db);
    let gateway = PersistenceGateway::new(store.clone(), owner);
    assert_eq!(gateway.load(page).await.unwrap(), content);
    assert_eq!(store.load_metadata(page).unwrap().version, 1);
}

#[tokio::test]
async fn test_gateway_refusals_map_to_notices() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let owner = UserId::new();
    let page = PageId::new();
    store.register_page(page, owner).unwrap();

    let intruder = PersistenceGateway::new(store.clone(), UserId::new());
    let err = intruder.persist(EditEvent::new(page, Content::null())).await.unwrap_err();
    assert_eq!(err, GatewayError::Unauthorized);
    assert_eq!(Notice::from_error(&err).severity, Severity::Error);

    let gateway = PersistenceGateway::new(store.clone(), owner);
    let missing = PageId::new();
    assert_eq!(
        gateway.persist(EditEvent::new(missing, Content::null())).await,
        Err(GatewayError::NotFound(missing))
    );
    let invalid = gateway.persist(EditEvent::new(page, Content::new("{\"open\":"))).await;
    assert!(matches!(invalid, Err(GatewayError::Validation(_))));
    assert!(store.load_content(page).unwrap().is_null());
}

#[tokio::test]
async fn test_sessions_over_page_store() {
    let dir = tempdir().unwrap();
    let store = open_store(&dir.path().join("db"));
    let owner = UserId::new();
    let page = PageId::new();
    store.register_page(page, owner).unwrap();

    let bus = LocalBus::new();
    let config = SessionConfig {
        quiet_period: Duration::from_millis(50),
        ..SessionConfig::default()
    };
    let writer = bus.client();
    let mut a = PageSession::open(page, writer.clone(), PersistenceGateway::new(store.clone(), owner), config.clone())
        .await
        .unwrap();
    let mut b = PageSession::open(page, bus.client(), PersistenceGateway::new(store.clone(), owner), config)
        .await
        .unwrap();
    assert_eq!(a.origin(), writer.origin());

    for text in ["[1]", "[1,2]", "[1,2,3]"] {
        a.edit(text).await.unwrap();
    }
    let saved = timeout(Duration::from_secs(2), a.next_event()).await.unwrap().unwrap();
    assert!(matches!(saved, SessionEvent::Saved(ref w) if w.content == Content::new("[1,2,3]")));

    let applied = timeout(Duration::from_secs(2), b.next_event()).await.unwrap().unwrap();
    assert!(matches!(applied, SessionEvent::RemoteApplied { .. }));
    assert_eq!(b.content(), Content::new("[1,2,3]"));
    assert_eq!(store.load_content(page).unwrap(), Content::new("[1,2,3]"));
    assert_eq!(store.load_metadata(page).unwrap().version, 1);

    a.close().await;
    b.close().await;
}
