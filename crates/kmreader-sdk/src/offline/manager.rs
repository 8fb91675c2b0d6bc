//! 离线下载管理器
//!
//! 决定哪些书需要物化到磁盘并执行传输。约束：
//! - 同一时刻最多一个传输任务；对已排队的书重复请求是 no-op
//! - 失败不自动重试，只有显式重试入口会把 failed 拉回 pending
//! - 手动删除先把系列策略改回 manual，防止策略立刻重新下载
//!
//! 目录布局：<root>/offline/<instance>/<book>/page-N.<ext> 或 book.epub

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::PageCache;
use crate::debounce::Debouncer;
use crate::error::{KMReaderError, Result};
use crate::events::{EventBus, StoreEvent};
use crate::gateway::Gateway;
use crate::offline::tracker::DownloadProgressTracker;
use crate::offline::RuntimeFlags;
use crate::storage::db_actor::PolicyOutcome;
use crate::storage::entities::{BookPage, DownloadStatus, KomgaBook, SeriesOfflinePolicy};
use crate::storage::MirrorStore;

/// 队列踢动的去抖窗口
const QUEUE_DEBOUNCE: Duration = Duration::from_secs(2);

/// EPUB 媒体 profile（单文件下载，其余按页下载）
const EPUB_PROFILE: &str = "EPUB";

struct ActiveDownload {
    book_id: String,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    active: Option<ActiveDownload>,
    processing: bool,
}

/// 离线下载管理器：内部状态由单把互斥锁串行化
pub struct OfflineManager {
    store: MirrorStore,
    gateway: Arc<dyn Gateway>,
    cache: Arc<PageCache>,
    events: EventBus,
    tracker: DownloadProgressTracker,
    flags: Arc<RuntimeFlags>,
    root: PathBuf,
    state: Mutex<ManagerState>,
    queue_debounce: Debouncer,
    download_concurrency: usize,
}

impl OfflineManager {
    pub fn new(
        data_dir: &Path,
        store: MirrorStore,
        gateway: Arc<dyn Gateway>,
        cache: Arc<PageCache>,
        events: EventBus,
        flags: Arc<RuntimeFlags>,
        download_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            cache,
            tracker: DownloadProgressTracker::new(events.clone()),
            events,
            flags,
            root: data_dir.join("offline"),
            state: Mutex::new(ManagerState::default()),
            queue_debounce: Debouncer::new(QUEUE_DEBOUNCE),
            download_concurrency: download_concurrency.max(1),
        })
    }

    pub fn tracker(&self) -> &DownloadProgressTracker {
        &self.tracker
    }

    // ---- 路径 ----

    fn book_dir(&self, instance_id: &str, book_id: &str) -> PathBuf {
        self.root.join(instance_id).join(book_id)
    }

    /// 已下载书目的某一页在磁盘上的路径
    pub async fn offline_page_path(
        &self,
        instance_id: &str,
        book_id: &str,
        page_number: i64,
    ) -> Option<PathBuf> {
        if !self.is_book_downloaded(instance_id, book_id).await {
            return None;
        }
        let dir = self.book_dir(instance_id, book_id);
        let prefix = format!("page-{}.", page_number);
        let mut entries = fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    return Some(entry.path());
                }
            }
        }
        None
    }

    /// 已下载 EPUB 的文件路径
    pub async fn offline_book_file(&self, instance_id: &str, book_id: &str) -> Option<PathBuf> {
        if !self.is_book_downloaded(instance_id, book_id).await {
            return None;
        }
        let path = self.book_dir(instance_id, book_id).join("book.epub");
        path.exists().then_some(path)
    }

    /// 移除一个实例的全部离线文件
    pub async fn remove_offline_data(&self, instance_id: &str) {
        let dir = self.root.join(instance_id);
        let _ = fs::remove_dir_all(&dir).await;
    }

    // ---- 查询 ----

    pub async fn download_status(&self, instance_id: &str, book_id: &str) -> DownloadStatus {
        let status = self.store.get_book_download_status(instance_id, book_id).await;
        // pending 且正在传输 → 对外报告 downloading + 进度
        if matches!(status, DownloadStatus::Pending) {
            if let Some(progress) = self.tracker.get(book_id) {
                return DownloadStatus::Downloading(progress);
            }
        }
        status
    }

    pub async fn is_book_downloaded(&self, instance_id: &str, book_id: &str) -> bool {
        matches!(
            self.store.get_book_download_status(instance_id, book_id).await,
            DownloadStatus::Downloaded
        )
    }

    // ---- 公开操作 ----

    /// 单书开关：downloaded → 删除；pending/downloading → 取消；其余 → 入队
    pub async fn toggle_download(self: &Arc<Self>, instance_id: &str, book_id: &str) {
        let status = self.download_status(instance_id, book_id).await;
        match status {
            DownloadStatus::Downloaded => self.delete_book(instance_id, book_id).await,
            DownloadStatus::Pending | DownloadStatus::Downloading(_) => {
                self.cancel_download(instance_id, book_id).await;
            }
            DownloadStatus::NotDownloaded | DownloadStatus::Failed(_) => {
                self.enqueue_book(instance_id, book_id).await;
            }
        }
    }

    /// failed/notDownloaded → pending 并踢队列
    pub async fn retry_download(self: &Arc<Self>, instance_id: &str, book_id: &str) {
        self.enqueue_book(instance_id, book_id).await;
    }

    async fn enqueue_book(self: &Arc<Self>, instance_id: &str, book_id: &str) {
        match self
            .store
            .update_book_download_status(
                instance_id,
                book_id,
                DownloadStatus::Pending,
                None,
                Some(Utc::now()),
                true,
            )
            .await
        {
            Ok(outcome) => {
                self.publish_status(instance_id, book_id);
                self.apply_policy_outcome(instance_id, &outcome).await;
                self.clone().sync_download_queue(instance_id.to_string()).await;
            }
            Err(e) => error!("入队失败 book={}: {}", book_id, e),
        }
    }

    /// 取消在途/排队传输，状态回 notDownloaded
    pub async fn cancel_download(self: &Arc<Self>, instance_id: &str, book_id: &str) {
        self.abort_active_if(book_id).await;
        self.tracker.clear(book_id);
        if let Ok(outcome) = self
            .store
            .update_book_download_status(
                instance_id,
                book_id,
                DownloadStatus::NotDownloaded,
                None,
                None,
                true,
            )
            .await
        {
            self.publish_status(instance_id, book_id);
            self.apply_policy_outcome(instance_id, &outcome).await;
        }
    }

    /// 取消当前在途传输（清理/登出用）
    pub async fn cancel_all_downloads(self: &Arc<Self>, instance_id: &str) {
        let active_book = {
            let mut state = self.state.lock().await;
            state.active.take().map(|active| {
                active.handle.abort();
                active.book_id
            })
        };
        if let Some(book_id) = active_book {
            self.tracker.clear(&book_id);
            let _ = self
                .store
                .update_book_download_status(
                    instance_id,
                    &book_id,
                    DownloadStatus::NotDownloaded,
                    None,
                    None,
                    true,
                )
                .await;
            self.publish_status(instance_id, &book_id);
        }
        self.queue_debounce.cancel();
    }

    /// 删除一本书的本地副本（文件 + 状态）
    pub async fn delete_book(self: &Arc<Self>, instance_id: &str, book_id: &str) {
        self.abort_active_if(book_id).await;
        self.tracker.clear(book_id);

        match self
            .store
            .update_book_download_status(
                instance_id,
                book_id,
                DownloadStatus::NotDownloaded,
                None,
                None,
                true,
            )
            .await
        {
            Ok(outcome) => {
                self.apply_policy_outcome(instance_id, &outcome).await;
            }
            Err(e) => error!("删除书目状态更新失败 book={}: {}", book_id, e),
        }

        let dir = self.book_dir(instance_id, book_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => info!("🗑️ 已删除离线书目: {}", book_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("删除离线文件失败 book={}: {}", book_id, e),
        }
        self.publish_status(instance_id, book_id);
    }

    /// 手动删除：先把系列策略改回 manual，防止策略自动重新下载
    pub async fn delete_book_manually(
        self: &Arc<Self>,
        instance_id: &str,
        series_id: &str,
        book_id: &str,
    ) {
        let _ = self
            .store
            .update_series_offline_policy(instance_id, series_id, SeriesOfflinePolicy::Manual)
            .await;
        self.delete_book(instance_id, book_id).await;
    }

    /// 批量手动删除（一个系列内）
    pub async fn delete_books_manually(
        self: &Arc<Self>,
        instance_id: &str,
        series_id: &str,
        book_ids: &[String],
    ) {
        let _ = self
            .store
            .update_series_offline_policy(instance_id, series_id, SeriesOfflinePolicy::Manual)
            .await;
        for book_id in book_ids {
            self.delete_book(instance_id, book_id).await;
        }
        let _ = self
            .store
            .sync_series_download_status(instance_id, series_id)
            .await;
    }

    /// 删除当前实例全部已下载书目
    pub async fn delete_all_downloaded_books(self: &Arc<Self>, instance_id: &str) {
        let books = self.store.fetch_downloaded_books(instance_id).await;
        self.delete_books_with_policy_reset(instance_id, books).await;
    }

    /// 删除已读完的已下载书目
    pub async fn delete_read_books(self: &Arc<Self>, instance_id: &str) {
        let books = self.store.fetch_downloaded_books(instance_id).await;
        let read_books: Vec<KomgaBook> = books.into_iter().filter(|b| b.is_read()).collect();
        self.delete_books_with_policy_reset(instance_id, read_books).await;
    }

    async fn delete_books_with_policy_reset(
        self: &Arc<Self>,
        instance_id: &str,
        books: Vec<KomgaBook>,
    ) {
        let series_ids: std::collections::HashSet<String> =
            books.iter().map(|b| b.series_id.clone()).collect();
        for series_id in &series_ids {
            let _ = self
                .store
                .update_series_offline_policy(instance_id, series_id, SeriesOfflinePolicy::Manual)
                .await;
        }
        for book in &books {
            self.delete_book(instance_id, &book.book_id).await;
        }
        for series_id in &series_ids {
            let _ = self
                .store
                .sync_series_download_status(instance_id, series_id)
                .await;
        }
    }

    /// 系列开关：有任何离线内容 → 全部移除；否则全部入队（策略改 manual）
    pub async fn toggle_series_download(self: &Arc<Self>, instance_id: &str, series_id: &str) {
        let Some(series) = self.store.get_series(instance_id, series_id).await else {
            return;
        };
        use crate::storage::entities::SeriesDownloadStatus::*;
        match series.local.download_status {
            Downloaded | PartiallyDownloaded { .. } | Pending { .. } => {
                self.remove_all_series_books(instance_id, series_id).await;
            }
            NotDownloaded => {
                self.download_all_series_books(instance_id, series_id).await;
            }
        }
    }

    pub async fn download_all_series_books(
        self: &Arc<Self>,
        instance_id: &str,
        series_id: &str,
    ) {
        let _ = self
            .store
            .update_series_offline_policy(instance_id, series_id, SeriesOfflinePolicy::Manual)
            .await;
        let book_ids = self
            .store
            .fetch_series_book_ids(instance_id, series_id, 0, usize::MAX / 2)
            .await;
        let books = self.store.fetch_books_by_ids(instance_id, book_ids).await;
        for book in books {
            if !matches!(
                book.download.status,
                DownloadStatus::Downloaded | DownloadStatus::Pending
            ) {
                let _ = self
                    .store
                    .update_book_download_status(
                        instance_id,
                        &book.book_id,
                        DownloadStatus::Pending,
                        None,
                        Some(Utc::now()),
                        false,
                    )
                    .await;
            }
        }
        let _ = self
            .store
            .sync_series_download_status(instance_id, series_id)
            .await;
        self.trigger_sync(instance_id, false);
    }

    pub async fn remove_all_series_books(self: &Arc<Self>, instance_id: &str, series_id: &str) {
        let _ = self
            .store
            .update_series_offline_policy(instance_id, series_id, SeriesOfflinePolicy::Manual)
            .await;
        let book_ids = self
            .store
            .fetch_series_book_ids(instance_id, series_id, 0, usize::MAX / 2)
            .await;
        for book_id in &book_ids {
            self.delete_book(instance_id, book_id).await;
        }
        let _ = self
            .store
            .sync_series_download_status(instance_id, series_id)
            .await;
    }

    /// failed → pending 并踢队列
    pub async fn retry_failed_downloads(self: &Arc<Self>, instance_id: &str) {
        if let Ok(count) = self.store.retry_failed_books(instance_id).await {
            if count > 0 {
                info!("🔁 重试 {} 本失败书目", count);
                self.trigger_sync(instance_id, true);
            }
        }
    }

    /// failed → notDownloaded
    pub async fn cancel_failed_downloads(&self, instance_id: &str) {
        let _ = self.store.cancel_failed_books(instance_id).await;
    }

    /// 策略评估结果落地：清理列表删文件，入队列表踢队列
    pub async fn apply_policy_outcome(
        self: &Arc<Self>,
        instance_id: &str,
        outcome: &PolicyOutcome,
    ) {
        for book_id in &outcome.cleanup_book_ids {
            Box::pin(self.delete_book(instance_id, book_id)).await;
        }
        if outcome.needs_queue_kick() {
            self.trigger_sync(instance_id, false);
        }
    }

    /// 更新系列离线策略并落地评估结果
    pub async fn update_series_offline_policy(
        self: &Arc<Self>,
        instance_id: &str,
        series_id: &str,
        policy: SeriesOfflinePolicy,
    ) -> Result<()> {
        let outcome = self
            .store
            .update_series_offline_policy(instance_id, series_id, policy)
            .await?;
        self.events.publish(StoreEvent::SeriesDownloadStatusChanged {
            instance_id: instance_id.to_string(),
            series_id: series_id.to_string(),
        });
        self.apply_policy_outcome(instance_id, &outcome).await;
        Ok(())
    }

    /// 去抖踢动下载队列；restart 跳过等待立即执行
    pub fn trigger_sync(self: &Arc<Self>, instance_id: &str, restart: bool) {
        let this = self.clone();
        let instance_id = instance_id.to_string();
        self.queue_debounce.call(restart, move || async move {
            this.sync_download_queue(instance_id).await;
        });
    }

    // ---- 队列 ----

    fn sync_download_queue(
        self: Arc<Self>,
        instance_id: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            if self.flags.is_offline() || self.flags.is_paused() {
                return;
            }
            {
                let mut state = self.state.lock().await;
                if state.processing || state.active.is_some() {
                    return;
                }
                state.processing = true;
            }

            let pending = self.store.fetch_pending_books(&instance_id, 1).await;

            let mut state = self.state.lock().await;
            state.processing = false;
            let Some(book) = pending.into_iter().next() else {
                return;
            };
            if state.active.is_some() {
                return;
            }

            let this = self.clone();
            let book_id = book.book_id.clone();
            let instance = instance_id.clone();
            let handle = tokio::spawn(async move {
                this.perform_download(instance, book).await;
            });
            state.active = Some(ActiveDownload { book_id, handle });
        })
    }

    async fn perform_download(self: Arc<Self>, instance_id: String, book: KomgaBook) {
        let book_id = book.book_id.clone();
        info!("⬇️ 开始下载: {} ({})", book.metadata.title, book_id);
        self.tracker.update(&instance_id, &book_id, 0.0);

        let result = self.execute_download(&instance_id, &book).await;
        match result {
            Ok(total_size) => {
                match self
                    .store
                    .update_book_download_status(
                        &instance_id,
                        &book_id,
                        DownloadStatus::Downloaded,
                        Some(total_size),
                        Some(Utc::now()),
                        true,
                    )
                    .await
                {
                    Ok(outcome) => self.apply_policy_outcome(&instance_id, &outcome).await,
                    Err(e) => error!("下载完成状态写回失败 book={}: {}", book_id, e),
                }
                // 下载完成后页面缓存里的副本没有意义了
                self.cache.clear_book(&instance_id, &book_id).await;
                info!("✅ 下载完成: {} ({} bytes)", book_id, total_size);
            }
            Err(e) if e.is_network_related() && self.flags.is_offline() => {
                // 网络断开导致的失败：保持 pending，恢复联网后继续
                warn!("⚠️ 网络中断，下载挂起: {}", book_id);
            }
            Err(e) => {
                error!("❌ 下载失败 book={}: {}", book_id, e);
                let _ = self
                    .store
                    .update_book_download_status(
                        &instance_id,
                        &book_id,
                        DownloadStatus::Failed(e.to_string()),
                        None,
                        None,
                        true,
                    )
                    .await;
            }
        }

        self.tracker.clear(&book_id);
        {
            let mut state = self.state.lock().await;
            if state
                .active
                .as_ref()
                .map(|a| a.book_id == book_id)
                .unwrap_or(false)
            {
                state.active = None;
            }
        }
        self.publish_status(&instance_id, &book_id);

        // 成功、失败都继续跑下一本
        self.clone().sync_download_queue(instance_id).await;
    }

    async fn execute_download(&self, instance_id: &str, book: &KomgaBook) -> Result<i64> {
        let dir = self.book_dir(instance_id, &book.book_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| KMReaderError::IO(format!("创建离线目录失败: {}", e)))?;

        // 页面元数据先落库，阅读器离线时直接读库
        let pages = self.gateway.book_pages(&book.book_id).await?;
        self.store
            .update_book_pages(instance_id, &book.book_id, pages.clone())
            .await?;

        if book.media_profile == EPUB_PROFILE {
            self.download_epub(&book.book_id, &dir).await?;
            self.tracker.update(instance_id, &book.book_id, 1.0);
        } else {
            self.download_pages(instance_id, &book.book_id, &pages, &dir)
                .await?;
        }

        directory_size(&dir).await
    }

    async fn download_epub(&self, book_id: &str, dir: &Path) -> Result<()> {
        let destination = dir.join("book.epub");
        if destination.exists() {
            return Ok(());
        }
        let data = self.gateway.book_file(book_id).await?;
        fs::write(&destination, &data)
            .await
            .map_err(|e| KMReaderError::IO(format!("写入 EPUB 失败: {}", e)))?;
        Ok(())
    }

    async fn download_pages(
        &self,
        instance_id: &str,
        book_id: &str,
        pages: &[BookPage],
        dir: &Path,
    ) -> Result<()> {
        let total = pages.len();
        if total == 0 {
            return Ok(());
        }

        // 跳过已存在的页，缓存里有的直接拷贝
        let mut to_download = Vec::new();
        for page in pages {
            let destination = dir.join(page_file_name(page));
            if destination.exists() {
                continue;
            }
            if self
                .cache
                .copy_page_to(instance_id, book_id, page, &destination)
                .await
            {
                continue;
            }
            to_download.push(page.clone());
        }

        let mut completed = total - to_download.len();
        if completed > 0 {
            self.tracker
                .update(instance_id, book_id, completed as f32 / total as f32);
        }
        if to_download.is_empty() {
            self.tracker.update(instance_id, book_id, 1.0);
            return Ok(());
        }

        let gateway = self.gateway.clone();
        let dir = dir.to_path_buf();
        let mut stream = futures_util::stream::iter(to_download.into_iter().map(|page| {
            let gateway = gateway.clone();
            let dir = dir.clone();
            let book_id = book_id.to_string();
            async move {
                let destination = dir.join(page_file_name(&page));
                if destination.exists() {
                    return Ok(());
                }
                let data = gateway.book_page(&book_id, page.number).await?;
                fs::write(&destination, &data)
                    .await
                    .map_err(|e| KMReaderError::IO(format!("写入页面失败: {}", e)))?;
                Ok::<(), KMReaderError>(())
            }
        }))
        .buffer_unordered(self.download_concurrency);

        while let Some(result) = stream.next().await {
            // 第一个错误终止整本传输，未完成的页被丢弃
            result?;
            completed += 1;
            self.tracker
                .update(instance_id, book_id, completed as f32 / total as f32);
        }
        Ok(())
    }

    // ---- 内部 ----

    async fn abort_active_if(&self, book_id: &str) {
        let mut state = self.state.lock().await;
        if state
            .active
            .as_ref()
            .map(|a| a.book_id == book_id)
            .unwrap_or(false)
        {
            if let Some(active) = state.active.take() {
                debug!("⛔ 中止在途下载: {}", active.book_id);
                active.handle.abort();
            }
        }
    }

    fn publish_status(&self, instance_id: &str, book_id: &str) {
        self.events.publish(StoreEvent::DownloadStatusChanged {
            instance_id: instance_id.to_string(),
            book_id: book_id.to_string(),
        });
    }
}

/// 页面落盘文件名：page-N.<ext>，扩展名取自文件名或媒体类型
pub(crate) fn page_file_name(page: &BookPage) -> String {
    let from_name = Path::new(&page.file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty());
    let ext = from_name.unwrap_or_else(|| match page.media_type.as_str() {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/avif" => "avif",
        "image/jp2" => "jp2",
        _ => "jpg",
    });
    format!("page-{}.{}", page.number, ext)
}

async fn directory_size(dir: &Path) -> Result<i64> {
    let mut total: i64 = 0;
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| KMReaderError::IO(format!("读取离线目录失败: {}", e)))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                total += meta.len() as i64;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(number: i64, file_name: &str, media_type: &str) -> BookPage {
        BookPage {
            number,
            file_name: file_name.to_string(),
            media_type: media_type.to_string(),
            width: None,
            height: None,
        }
    }

    #[test]
    fn page_file_name_prefers_original_extension() {
        assert_eq!(
            page_file_name(&page(3, "003.webp", "image/jpeg")),
            "page-3.webp"
        );
        assert_eq!(page_file_name(&page(4, "cover", "image/png")), "page-4.png");
        assert_eq!(
            page_file_name(&page(5, "", "application/octet-stream")),
            "page-5.jpg"
        );
    }

    #[tokio::test]
    async fn directory_size_sums_files() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("a"), vec![0u8; 10])
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("b"), vec![0u8; 5])
            .await
            .unwrap();
        assert_eq!(directory_size(dir.path()).await.unwrap(), 15);
    }
}
