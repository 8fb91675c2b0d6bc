//! 离线下载集成测试：下载流程、状态机、策略联动

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{book_dto, book_pages, series_dto, wait_until, MockGateway};
use kmreader_sdk::cache::PageCache;
use kmreader_sdk::gateway::sse::{BookSse, SseEvent};
use kmreader_sdk::storage::entities::{
    DownloadStatus, SeriesDownloadStatus, SeriesOfflinePolicy,
};
use kmreader_sdk::{
    EventBus, MirrorStore, OfflineManager, RuntimeFlags, SseDispatcher, SyncEngine,
};

struct Fixture {
    _dir: TempDir,
    gateway: Arc<MockGateway>,
    store: MirrorStore,
    offline: Arc<OfflineManager>,
    engine: Arc<SyncEngine>,
    flags: Arc<RuntimeFlags>,
    events: EventBus,
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
    Fixture {
        _dir: dir,
        gateway,
        store,
        offline,
        engine,
        flags,
        events,
    }
}

async fn seed_series_with_books(f: &Fixture, series_id: &str, book_count: usize) {
    f.gateway
        .insert_series(series_dto(series_id, "Akira", book_count as i64));
    for i in 1..=book_count {
        f.gateway.insert_book(
            book_dto(&format!("b{}", i), series_id, i as f64),
            book_pages(3),
        );
    }
    f.engine
        .sync_series_detail("inst", series_id)
        .await
        .unwrap();
    f.engine
        .sync_all_series_books("inst", series_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn toggle_download_completes_transfer() {
    let f = fixture();
    seed_series_with_books(&f, "s1", 1).await;

    f.offline.toggle_download("inst", "b1").await;

    assert!(
        wait_until(|| async {
            matches!(
                f.store.get_book_download_status("inst", "b1").await,
                DownloadStatus::Downloaded
            )
        })
        .await,
        "下载未在预期时间内完成"
    );

    // 三页都落了盘，记录的体积等于真实文件大小之和
    let book = f.store.get_book("inst", "b1").await.unwrap();
    assert!(book.download.downloaded_size > 0);
    assert_eq!(book.pages.len(), 3);

    let page1 = f.offline.offline_page_path("inst", "b1", 1).await;
    assert!(page1.is_some());
    let expected: i64 = (1..=3).map(|n| (n + 1) * 16).sum::<i64>();
    assert_eq!(book.download.downloaded_size, expected);

    // 聚合状态跟着变
    let series = f.store.get_series("inst", "s1").await.unwrap();
    assert_eq!(
        series.local.download_status,
        SeriesDownloadStatus::Downloaded
    );
}

#[tokio::test]
async fn toggle_on_downloaded_book_removes_it() {
    let f = fixture();
    seed_series_with_books(&f, "s1", 1).await;

    f.offline.toggle_download("inst", "b1").await;
    wait_until(|| async {
        matches!(
            f.store.get_book_download_status("inst", "b1").await,
            DownloadStatus::Downloaded
        )
    })
    .await;

    // 第二次 toggle：删除本地副本
    f.offline.toggle_download("inst", "b1").await;
    assert_eq!(
        f.store.get_book_download_status("inst", "b1").await,
        DownloadStatus::NotDownloaded
    );
    assert!(f.offline.offline_page_path("inst", "b1", 1).await.is_none());
}

#[tokio::test]
async fn failed_download_records_error_and_never_auto_retries() {
    let f = fixture();
    seed_series_with_books(&f, "s1", 1).await;

    // 入队后网络故障（flags 仍是在线，网络类错误按失败处理）
    f.gateway.set_network_failing(true);
    f.offline.toggle_download("inst", "b1").await;

    assert!(
        wait_until(|| async {
            matches!(
                f.store.get_book_download_status("inst", "b1").await,
                DownloadStatus::Failed(_)
            )
        })
        .await
    );
    let status = f.store.get_book_download_status("inst", "b1").await;
    if let DownloadStatus::Failed(error) = &status {
        assert!(!error.is_empty());
    }

    // 网络恢复后不自动重试：状态保持 failed
    f.gateway.set_network_failing(false);
    f.offline.trigger_sync("inst", true);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(matches!(
        f.store.get_book_download_status("inst", "b1").await,
        DownloadStatus::Failed(_)
    ));

    // 显式重试才重新入队并完成
    f.offline.retry_failed_downloads("inst").await;
    assert!(
        wait_until(|| async {
            matches!(
                f.store.get_book_download_status("inst", "b1").await,
                DownloadStatus::Downloaded
            )
        })
        .await
    );
}

#[tokio::test]
async fn book_added_event_respects_offline_policy() {
    // 暂停队列执行，观察纯状态变化
    let f = fixture();
    f.flags.set_paused(true);
    seed_series_with_books(&f, "s1", 3).await;

    f.offline
        .update_series_offline_policy("inst", "s1", SeriesOfflinePolicy::UnreadOnly)
        .await
        .unwrap();
    // 已有 3 本未读书被标记 pending
    for i in 1..=3 {
        assert_eq!(
            f.store
                .get_book_download_status("inst", &format!("b{}", i))
                .await,
            DownloadStatus::Pending
        );
    }

    // 服务端新增第 4 本：SSE BookAdded → 自动转 pending
    f.gateway
        .insert_book(book_dto("b4", "s1", 4.0), book_pages(3));
    let dispatcher = SseDispatcher::new(
        f.engine.clone(),
        f.store.clone(),
        f.offline.clone(),
        f.events.clone(),
    );
    dispatcher
        .handle_event(
            "inst",
            SseEvent::BookAdded(BookSse {
                book_id: "b4".to_string(),
                series_id: "s1".to_string(),
                library_id: "lib-1".to_string(),
            }),
        )
        .await;
    assert_eq!(
        f.store.get_book_download_status("inst", "b4").await,
        DownloadStatus::Pending
    );
}

#[tokio::test]
async fn manual_policy_leaves_new_book_alone() {
    let f = fixture();
    f.flags.set_paused(true);
    seed_series_with_books(&f, "s1", 1).await;

    f.gateway
        .insert_book(book_dto("b2", "s1", 2.0), book_pages(3));
    let dispatcher = SseDispatcher::new(
        f.engine.clone(),
        f.store.clone(),
        f.offline.clone(),
        f.events.clone(),
    );
    dispatcher
        .handle_event(
            "inst",
            SseEvent::BookAdded(BookSse {
                book_id: "b2".to_string(),
                series_id: "s1".to_string(),
                library_id: "lib-1".to_string(),
            }),
        )
        .await;

    // 默认策略 manual：什么都不发生
    assert_eq!(
        f.store.get_book_download_status("inst", "b2").await,
        DownloadStatus::NotDownloaded
    );
}

#[tokio::test]
async fn cancel_returns_book_to_not_downloaded() {
    let f = fixture();
    f.flags.set_paused(true);
    seed_series_with_books(&f, "s1", 1).await;

    // 入队（暂停中不会真正开始传输）
    f.offline.toggle_download("inst", "b1").await;
    assert_eq!(
        f.store.get_book_download_status("inst", "b1").await,
        DownloadStatus::Pending
    );

    f.offline.cancel_download("inst", "b1").await;
    assert_eq!(
        f.store.get_book_download_status("inst", "b1").await,
        DownloadStatus::NotDownloaded
    );
}

#[tokio::test]
async fn offline_network_error_keeps_book_pending() {
    let f = fixture();
    seed_series_with_books(&f, "s1", 1).await;

    // 传输中网络掉线且进入离线模式：不标 failed，保持 pending 等恢复
    f.gateway.set_network_failing(true);
    f.flags.set_offline(true);
    // 直接入队（离线时队列不跑，但手动触发一次传输路径验证语义）
    f.offline.toggle_download("inst", "b1").await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(
        f.store.get_book_download_status("inst", "b1").await,
        DownloadStatus::Pending
    );
}

#[tokio::test]
async fn read_list_counters_follow_member_status() {
    use chrono::{TimeZone, Utc};
    use kmreader_sdk::gateway::ReadListDto;

    let f = fixture();
    f.flags.set_paused(true);
    seed_series_with_books(&f, "s1", 2).await;
    f.gateway.read_lists.lock().unwrap().insert(
        "r1".to_string(),
        ReadListDto {
            id: "r1".to_string(),
            name: "Backlog".to_string(),
            summary: String::new(),
            ordered: true,
            book_ids: vec!["b1".to_string(), "b2".to_string()],
            created_date: Utc.timestamp_millis_opt(1_000).unwrap(),
            last_modified_date: Utc.timestamp_millis_opt(2_000).unwrap(),
        },
    );
    f.engine.sync_read_list("inst", "r1").await.unwrap();

    f.store
        .update_book_download_status(
            "inst",
            "b1",
            DownloadStatus::Downloaded,
            Some(4096),
            Some(Utc::now()),
            true,
        )
        .await
        .unwrap();

    let read_list = f.store.get_read_list("inst", "r1").await.unwrap();
    assert_eq!(read_list.downloaded_books, 1);
    assert_eq!(read_list.pending_books, 0);
    assert_eq!(read_list.downloaded_size, 4096);
}
