//! 阅读进度回放集成测试：写前记录、服务端确认、失败保留

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{book_dto, book_pages, series_dto, MockGateway};
use kmreader_sdk::cache::PageCache;
use kmreader_sdk::{
    EventBus, MirrorStore, OfflineManager, ProgressSyncService, RuntimeFlags, SyncEngine,
};

struct Fixture {
    _dir: TempDir,
    gateway: Arc<MockGateway>,
    store: MirrorStore,
    progress: ProgressSyncService,
    flags: Arc<RuntimeFlags>,
    #[allow(dead_code)]
    offline: Arc<OfflineManager>,
}

fn fixture() -> Fixture {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(MockGateway::new());
    let store = MirrorStore::open(dir.path()).unwrap();
    let events = EventBus::new();
    let flags = Arc::new(RuntimeFlags::new());
    let cache = Arc::new(PageCache::new(dir.path(), 100));
    let engine = Arc::new(SyncEngine::new(
        gateway.clone(),
        store.clone(),
        events.clone(),
        100,
    ));
    let offline = OfflineManager::new(
        dir.path(),
        store.clone(),
        gateway.clone(),
        cache,
        events.clone(),
        flags.clone(),
        2,
    );
    let progress = ProgressSyncService::new(
        store.clone(),
        gateway.clone(),
        engine.clone(),
        events,
        flags.clone(),
    );
    Fixture {
        _dir: dir,
        gateway,
        store,
        progress,
        flags,
        offline,
    }
}

async fn seed_book(f: &Fixture) {
    f.gateway.insert_series(series_dto("s1", "Akira", 1));
    f.gateway
        .insert_book(book_dto("b1", "s1", 1.0), book_pages(20));
    f.store
        .upsert_series_list("inst", vec![series_dto("s1", "Akira", 1)])
        .await
        .unwrap();
    f.store
        .upsert_books("inst", vec![book_dto("b1", "s1", 1.0)])
        .await
        .unwrap();
}

#[tokio::test]
async fn offline_update_creates_pending_row_and_replays_on_reconnect() {
    let f = fixture();
    seed_book(&f).await;

    // 离线更新：只落本地，服务端没有被调用
    f.flags.set_offline(true);
    f.progress
        .record_progress("inst", "b1", 7, false, None)
        .await
        .unwrap();

    assert!(f.gateway.progress_calls.lock().unwrap().is_empty());
    let pending = f.store.fetch_pending_progress("inst").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].page, 7);

    let book = f.store.get_book("inst", "b1").await.unwrap();
    assert_eq!(book.read_progress.unwrap().page, 7);

    // 重连：按序回放，服务端确认后写前记录删除
    f.flags.set_offline(false);
    let report = f.progress.sync_pending_progress("inst").await;
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);

    let calls = f.gateway.progress_calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("b1".to_string(), 7, false)]);
    assert!(f
        .store
        .fetch_pending_progress("inst")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_replay_keeps_pending_row_for_next_attempt() {
    let f = fixture();
    seed_book(&f).await;

    f.flags.set_offline(true);
    f.progress
        .record_progress("inst", "b1", 3, false, None)
        .await
        .unwrap();
    f.flags.set_offline(false);

    // 服务端拒绝：记录保留，下一轮重试成功后才删除
    f.gateway.set_progress_failing(true);
    let report = f.progress.sync_pending_progress("inst").await;
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(f.store.fetch_pending_progress("inst").await.unwrap().len(), 1);

    f.gateway.set_progress_failing(false);
    let report = f.progress.sync_pending_progress("inst").await;
    assert_eq!(report.synced, 1);
    assert!(f
        .store
        .fetch_pending_progress("inst")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn completed_replay_resyncs_book_and_series() {
    let f = fixture();
    seed_book(&f).await;

    f.flags.set_offline(true);
    f.progress
        .record_progress("inst", "b1", 19, true, None)
        .await
        .unwrap();
    f.flags.set_offline(false);

    let report = f.progress.sync_pending_progress("inst").await;
    assert_eq!(report.synced, 1);

    // 回放后书目从服务端带回已确认的进度
    let book = f.store.get_book("inst", "b1").await.unwrap();
    let progress = book.read_progress.unwrap();
    assert!(progress.completed);
    assert_eq!(progress.page, 19);
}

#[tokio::test]
async fn newer_update_for_same_book_replaces_pending_value() {
    let f = fixture();
    seed_book(&f).await;

    f.flags.set_offline(true);
    f.progress
        .record_progress("inst", "b1", 3, false, None)
        .await
        .unwrap();
    f.progress
        .record_progress("inst", "b1", 9, false, None)
        .await
        .unwrap();

    // 同一本书只保留最新一条待回放记录
    let pending = f.store.fetch_pending_progress("inst").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].page, 9);

    f.flags.set_offline(false);
    let report = f.progress.sync_pending_progress("inst").await;
    assert_eq!(report.synced, 1);
    let calls = f.gateway.progress_calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("b1".to_string(), 9, false)]);
}

#[tokio::test]
async fn reflowable_position_blob_survives_round_trip() {
    let f = fixture();
    seed_book(&f).await;

    f.flags.set_offline(true);
    let position = r#"{"href":"chapter3.xhtml","progression":0.42}"#;
    f.progress
        .record_progress("inst", "b1", 0, false, Some(position.to_string()))
        .await
        .unwrap();

    let pending = f.store.fetch_pending_progress("inst").await.unwrap();
    assert_eq!(pending[0].position.as_deref(), Some(position));
}
