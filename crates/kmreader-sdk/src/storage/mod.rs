//! 存储模块 - 本地镜像的数据持久化层
//!
//! 分层设计：
//! - MirrorStore: 统一门面，外部只经由它访问镜像
//! - DbActor: 单线程 SQLite 访问（见 db_actor）
//! - DAO Layer: 每张表一个操作模块
//! - KvStore: sled 设置与小状态
//!
//! 读接口的失败语义：本地库在健康设备上不应失败，查询出错时
//! 记录日志并按「空结果」处理，绝不向 UI 抛错；写接口照常传播错误。

pub mod dao;
pub mod db_actor;
pub mod entities;
pub mod kv;
pub mod migrate;

pub use dao::{SeriesFilter, Sort, SortField};
pub use db_actor::{DbActorHandle, PolicyOutcome};
pub use kv::KvStore;

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;
use crate::gateway::{BookDto, CollectionDto, LibraryDto, ReadListDto, SeriesDto};
use entities::{
    BookPage, DownloadStatus, KomgaBook, KomgaCollection, KomgaLibrary, KomgaReadList,
    KomgaSeries, PendingProgress, SeriesOfflinePolicy,
};

/// 镜像存储门面
#[derive(Debug, Clone)]
pub struct MirrorStore {
    actor: DbActorHandle,
}

impl MirrorStore {
    /// 打开 <data_dir>/mirror.db 并启动数据库 Actor
    pub fn open(data_dir: &Path) -> Result<Self> {
        let actor = DbActorHandle::spawn(&data_dir.join("mirror.db"))?;
        Ok(Self { actor })
    }

    pub fn shutdown(&self) {
        self.actor.shutdown();
    }

    // ---- 同步写入（错误传播给同步引擎） ----

    pub async fn upsert_series_list(&self, instance_id: &str, dtos: Vec<SeriesDto>) -> Result<()> {
        self.actor.upsert_series_list(instance_id, dtos).await
    }

    pub async fn upsert_books(&self, instance_id: &str, dtos: Vec<BookDto>) -> Result<()> {
        self.actor.upsert_books(instance_id, dtos).await
    }

    pub async fn upsert_collections(
        &self,
        instance_id: &str,
        dtos: Vec<CollectionDto>,
    ) -> Result<()> {
        self.actor.upsert_collections(instance_id, dtos).await
    }

    pub async fn upsert_read_lists(
        &self,
        instance_id: &str,
        dtos: Vec<ReadListDto>,
    ) -> Result<()> {
        self.actor.upsert_read_lists(instance_id, dtos).await
    }

    pub async fn replace_libraries(
        &self,
        instance_id: &str,
        libraries: Vec<LibraryDto>,
    ) -> Result<()> {
        self.actor.replace_libraries(instance_id, libraries).await
    }

    pub async fn delete_series(&self, instance_id: &str, series_id: &str) -> Result<bool> {
        self.actor.delete_series(instance_id, series_id).await
    }

    pub async fn delete_book(&self, instance_id: &str, book_id: &str) -> Result<bool> {
        self.actor.delete_book(instance_id, book_id).await
    }

    pub async fn delete_collection(&self, instance_id: &str, collection_id: &str) -> Result<bool> {
        self.actor.delete_collection(instance_id, collection_id).await
    }

    pub async fn delete_read_list(&self, instance_id: &str, read_list_id: &str) -> Result<bool> {
        self.actor.delete_read_list(instance_id, read_list_id).await
    }

    pub async fn update_series_collection_ids(
        &self,
        instance_id: &str,
        series_id: &str,
        collection_ids: Vec<String>,
    ) -> Result<()> {
        self.actor
            .update_series_collection_ids(instance_id, series_id, collection_ids)
            .await
    }

    pub async fn update_book_read_list_ids(
        &self,
        instance_id: &str,
        book_id: &str,
        read_list_ids: Vec<String>,
    ) -> Result<()> {
        self.actor
            .update_book_read_list_ids(instance_id, book_id, read_list_ids)
            .await
    }

    pub async fn clear_instance_data(&self, instance_id: &str) -> Result<()> {
        self.actor.clear_instance_data(instance_id).await
    }

    // ---- 本地状态写入 ----

    pub async fn update_series_offline_policy(
        &self,
        instance_id: &str,
        series_id: &str,
        policy: SeriesOfflinePolicy,
    ) -> Result<PolicyOutcome> {
        self.actor
            .update_series_offline_policy(instance_id, series_id, policy)
            .await
    }

    pub async fn set_series_pinned(
        &self,
        instance_id: &str,
        series_id: &str,
        pinned: bool,
    ) -> Result<()> {
        self.actor
            .set_series_pinned(instance_id, series_id, pinned)
            .await
    }

    pub async fn set_collection_pinned(
        &self,
        instance_id: &str,
        collection_id: &str,
        pinned: bool,
    ) -> Result<()> {
        self.actor
            .set_collection_pinned(instance_id, collection_id, pinned)
            .await
    }

    pub async fn set_read_list_pinned(
        &self,
        instance_id: &str,
        read_list_id: &str,
        pinned: bool,
    ) -> Result<()> {
        self.actor
            .set_read_list_pinned(instance_id, read_list_id, pinned)
            .await
    }

    pub async fn sync_series_download_status(
        &self,
        instance_id: &str,
        series_id: &str,
    ) -> Result<PolicyOutcome> {
        self.actor
            .sync_series_download_status(instance_id, series_id)
            .await
    }

    pub async fn update_book_download_status(
        &self,
        instance_id: &str,
        book_id: &str,
        status: DownloadStatus,
        downloaded_size: Option<i64>,
        download_at: Option<DateTime<Utc>>,
        sync_series_status: bool,
    ) -> Result<PolicyOutcome> {
        self.actor
            .update_book_download_status(
                instance_id,
                book_id,
                status,
                downloaded_size,
                download_at,
                sync_series_status,
            )
            .await
    }

    pub async fn retry_failed_books(&self, instance_id: &str) -> Result<usize> {
        self.actor.retry_failed_books(instance_id).await
    }

    pub async fn cancel_failed_books(&self, instance_id: &str) -> Result<usize> {
        self.actor.cancel_failed_books(instance_id).await
    }

    pub async fn update_book_pages(
        &self,
        instance_id: &str,
        book_id: &str,
        pages: Vec<BookPage>,
    ) -> Result<()> {
        self.actor.update_book_pages(instance_id, book_id, pages).await
    }

    pub async fn update_read_progress(
        &self,
        instance_id: &str,
        book_id: &str,
        page: i64,
        completed: bool,
        position: Option<String>,
        record_pending: bool,
    ) -> Result<PolicyOutcome> {
        self.actor
            .update_read_progress(instance_id, book_id, page, completed, position, record_pending)
            .await
    }

    pub async fn fetch_pending_progress(&self, instance_id: &str) -> Result<Vec<PendingProgress>> {
        self.actor.fetch_pending_progress(instance_id).await
    }

    pub async fn delete_pending_progress(&self, id: i64) -> Result<bool> {
        self.actor.delete_pending_progress(id).await
    }

    // ---- 读接口（失败 → 空结果） ----

    pub async fn fetch_series_ids(
        &self,
        instance_id: &str,
        filter: SeriesFilter,
        sort: Sort,
        offset: usize,
        limit: usize,
    ) -> Vec<String> {
        self.actor
            .fetch_series_ids(instance_id, filter, sort, offset, limit)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_series_ids 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn fetch_series_by_ids(
        &self,
        instance_id: &str,
        ids: Vec<String>,
    ) -> Vec<KomgaSeries> {
        self.actor
            .fetch_series_by_ids(instance_id, ids)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_series_by_ids 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn get_series(&self, instance_id: &str, series_id: &str) -> Option<KomgaSeries> {
        self.actor
            .get_series(instance_id, series_id)
            .await
            .unwrap_or_else(|e| {
                warn!("get_series 失败，按不存在处理: {}", e);
                None
            })
    }

    pub async fn fetch_series_book_ids(
        &self,
        instance_id: &str,
        series_id: &str,
        offset: usize,
        limit: usize,
    ) -> Vec<String> {
        self.actor
            .fetch_series_book_ids(instance_id, series_id, offset, limit)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_series_book_ids 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn fetch_books_by_ids(&self, instance_id: &str, ids: Vec<String>) -> Vec<KomgaBook> {
        self.actor
            .fetch_books_by_ids(instance_id, ids)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_books_by_ids 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn get_book(&self, instance_id: &str, book_id: &str) -> Option<KomgaBook> {
        self.actor
            .get_book(instance_id, book_id)
            .await
            .unwrap_or_else(|e| {
                warn!("get_book 失败，按不存在处理: {}", e);
                None
            })
    }

    pub async fn fetch_collection_ids(
        &self,
        instance_id: &str,
        search: Option<String>,
        sort: Sort,
        offset: usize,
        limit: usize,
    ) -> Vec<String> {
        self.actor
            .fetch_collection_ids(instance_id, search, sort, offset, limit)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_collection_ids 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn get_collection(
        &self,
        instance_id: &str,
        collection_id: &str,
    ) -> Option<KomgaCollection> {
        self.actor
            .get_collection(instance_id, collection_id)
            .await
            .unwrap_or_else(|e| {
                warn!("get_collection 失败，按不存在处理: {}", e);
                None
            })
    }

    pub async fn fetch_read_list_ids(
        &self,
        instance_id: &str,
        search: Option<String>,
        sort: Sort,
        offset: usize,
        limit: usize,
    ) -> Vec<String> {
        self.actor
            .fetch_read_list_ids(instance_id, search, sort, offset, limit)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_read_list_ids 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn get_read_list(
        &self,
        instance_id: &str,
        read_list_id: &str,
    ) -> Option<KomgaReadList> {
        self.actor
            .get_read_list(instance_id, read_list_id)
            .await
            .unwrap_or_else(|e| {
                warn!("get_read_list 失败，按不存在处理: {}", e);
                None
            })
    }

    pub async fn fetch_libraries(&self, instance_id: &str) -> Vec<KomgaLibrary> {
        self.actor
            .fetch_libraries(instance_id)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_libraries 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn fetch_pending_books(&self, instance_id: &str, limit: usize) -> Vec<KomgaBook> {
        self.actor
            .fetch_pending_books(instance_id, limit)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_pending_books 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn fetch_downloaded_books(&self, instance_id: &str) -> Vec<KomgaBook> {
        self.actor
            .fetch_downloaded_books(instance_id)
            .await
            .unwrap_or_else(|e| {
                warn!("fetch_downloaded_books 失败，按空结果处理: {}", e);
                Vec::new()
            })
    }

    pub async fn fetch_failed_books_count(&self, instance_id: &str) -> i64 {
        self.actor
            .fetch_failed_books_count(instance_id)
            .await
            .unwrap_or(0)
    }

    pub async fn get_book_download_status(
        &self,
        instance_id: &str,
        book_id: &str,
    ) -> DownloadStatus {
        self.actor
            .get_book_download_status(instance_id, book_id)
            .await
            .unwrap_or(DownloadStatus::NotDownloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{SeriesDownloadStatus, SeriesOfflinePolicy};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn series_dto(id: &str) -> SeriesDto {
        SeriesDto {
            id: id.to_string(),
            library_id: "lib-1".to_string(),
            name: format!("Series {}", id),
            books_count: 2,
            books_read_count: 0,
            books_unread_count: 2,
            books_in_progress_count: 0,
            metadata: Default::default(),
            created: Utc.timestamp_millis_opt(1_000).unwrap(),
            last_modified: Utc.timestamp_millis_opt(2_000).unwrap(),
            deleted: false,
            oneshot: false,
        }
    }

    fn book_dto(id: &str, series_id: &str, number: f64) -> BookDto {
        BookDto {
            id: id.to_string(),
            series_id: series_id.to_string(),
            library_id: "lib-1".to_string(),
            name: format!("Book {}", id),
            size_bytes: 100,
            media: Default::default(),
            metadata: crate::gateway::BookMetadataDto {
                number_sort: number,
                ..Default::default()
            },
            read_progress: None,
            created: Utc.timestamp_millis_opt(1_000).unwrap(),
            last_modified: Utc.timestamp_millis_opt(2_000).unwrap(),
            deleted: false,
            oneshot: false,
        }
    }

    #[tokio::test]
    async fn upsert_twice_yields_identical_state() {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();

        let dtos = vec![series_dto("sA"), series_dto("sB")];
        store.upsert_series_list("inst", dtos.clone()).await.unwrap();
        let first = store
            .fetch_series_ids("inst", SeriesFilter::default(), Sort::default(), 0, 20)
            .await;

        store.upsert_series_list("inst", dtos).await.unwrap();
        let second = store
            .fetch_series_ids("inst", SeriesFilter::default(), Sort::default(), 0, 20)
            .await;

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        store.shutdown();
    }

    #[tokio::test]
    async fn composite_keys_isolate_instances() {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();

        store
            .upsert_series_list("inst-a", vec![series_dto("s1")])
            .await
            .unwrap();
        store
            .upsert_series_list("inst-b", vec![series_dto("s1")])
            .await
            .unwrap();

        let a = store.get_series("inst-a", "s1").await.unwrap();
        let b = store.get_series("inst-b", "s1").await.unwrap();
        assert_eq!(a.id, "inst-a_s1");
        assert_eq!(b.id, "inst-b_s1");

        store.clear_instance_data("inst-a").await.unwrap();
        assert!(store.get_series("inst-a", "s1").await.is_none());
        assert!(store.get_series("inst-b", "s1").await.is_some());
        store.shutdown();
    }

    #[tokio::test]
    async fn unread_only_policy_queues_unread_books() {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();

        store
            .upsert_series_list("inst", vec![series_dto("s1")])
            .await
            .unwrap();
        store
            .upsert_books(
                "inst",
                vec![book_dto("b1", "s1", 1.0), book_dto("b2", "s1", 2.0)],
            )
            .await
            .unwrap();

        let outcome = store
            .update_series_offline_policy("inst", "s1", SeriesOfflinePolicy::UnreadOnly)
            .await
            .unwrap();

        let mut queued = outcome.queued_book_ids.clone();
        queued.sort();
        assert_eq!(queued, vec!["b1", "b2"]);
        assert!(matches!(
            outcome.status,
            Some(SeriesDownloadStatus::Pending { pending: 2, .. })
        ));
        assert_eq!(
            store.get_book_download_status("inst", "b1").await,
            DownloadStatus::Pending
        );
        store.shutdown();
    }

    #[tokio::test]
    async fn manual_policy_does_nothing_automatically() {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();

        store
            .upsert_series_list("inst", vec![series_dto("s1")])
            .await
            .unwrap();
        store
            .upsert_books("inst", vec![book_dto("b1", "s1", 1.0)])
            .await
            .unwrap();

        let outcome = store.sync_series_download_status("inst", "s1").await.unwrap();
        assert!(outcome.queued_book_ids.is_empty());
        assert_eq!(
            store.get_book_download_status("inst", "b1").await,
            DownloadStatus::NotDownloaded
        );
        store.shutdown();
    }

    #[tokio::test]
    async fn cleanup_read_policy_reports_read_books() {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();

        store
            .upsert_series_list("inst", vec![series_dto("s1")])
            .await
            .unwrap();
        store
            .upsert_books("inst", vec![book_dto("b1", "s1", 1.0)])
            .await
            .unwrap();
        store
            .update_series_offline_policy("inst", "s1", SeriesOfflinePolicy::UnreadOnlyAndCleanupRead)
            .await
            .unwrap();
        store
            .update_book_download_status(
                "inst",
                "b1",
                DownloadStatus::Downloaded,
                Some(2048),
                Some(Utc::now()),
                true,
            )
            .await
            .unwrap();

        // 读完 → 策略报告需要清理本地副本
        let outcome = store
            .update_read_progress("inst", "b1", 19, true, None, false)
            .await
            .unwrap();
        assert_eq!(outcome.cleanup_book_ids, vec!["b1"]);
        store.shutdown();
    }
}
