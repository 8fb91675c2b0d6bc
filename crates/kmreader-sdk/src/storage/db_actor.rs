//! 数据库 Actor - 单线程数据库访问模型
//!
//! 核心设计：
//! - SQLite Connection 永远只在一个专用线程中
//! - 所有数据库操作通过 channel 发送命令
//! - 无跨线程使用，无锁竞争
//! - 跨表逻辑（聚合下载状态、策略评估）也在这里串行执行

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::Connection;
use std::path::Path;
use std::thread;
use tracing::{debug, error, info};

use crate::error::{KMReaderError, Result};
use crate::gateway::{BookDto, CollectionDto, LibraryDto, ReadListDto, SeriesDto};
use crate::storage::dao::{
    BookDao, CollectionDao, LibraryDao, PendingProgressDao, ReadListDao, SeriesDao, SeriesFilter,
    Sort,
};
use crate::storage::entities::{
    BookPage, DownloadStatus, KomgaBook, KomgaCollection, KomgaLibrary, KomgaReadList,
    KomgaSeries, PendingProgress, SeriesDownloadStatus, SeriesOfflinePolicy,
};
use crate::storage::migrate;

type Respond<T> = tokio::sync::oneshot::Sender<Result<T>>;

/// 策略评估结果：actor 只改状态，文件与网络副作用交给离线管理器
#[derive(Debug, Default, Clone)]
pub struct PolicyOutcome {
    /// 本次被标记为 pending 的书（需要踢一次下载队列）
    pub queued_book_ids: Vec<String>,
    /// 策略要求删除本地副本的书
    pub cleanup_book_ids: Vec<String>,
    /// 重算后的聚合状态
    pub status: Option<SeriesDownloadStatus>,
}

impl PolicyOutcome {
    pub fn needs_queue_kick(&self) -> bool {
        !self.queued_book_ids.is_empty()
    }
}

/// 数据库命令
pub enum DbCommand {
    // ---- 系列 ----
    UpsertSeriesList {
        instance_id: String,
        dtos: Vec<SeriesDto>,
        respond_to: Respond<()>,
    },
    DeleteSeries {
        instance_id: String,
        series_id: String,
        respond_to: Respond<bool>,
    },
    GetSeries {
        instance_id: String,
        series_id: String,
        respond_to: Respond<Option<KomgaSeries>>,
    },
    FetchSeriesIds {
        instance_id: String,
        filter: SeriesFilter,
        sort: Sort,
        offset: usize,
        limit: usize,
        respond_to: Respond<Vec<String>>,
    },
    FetchSeriesByIds {
        instance_id: String,
        ids: Vec<String>,
        respond_to: Respond<Vec<KomgaSeries>>,
    },
    UpdateSeriesOfflinePolicy {
        instance_id: String,
        series_id: String,
        policy: SeriesOfflinePolicy,
        respond_to: Respond<PolicyOutcome>,
    },
    SetSeriesPinned {
        instance_id: String,
        series_id: String,
        pinned: bool,
        respond_to: Respond<()>,
    },
    UpdateSeriesCollectionIds {
        instance_id: String,
        series_id: String,
        collection_ids: Vec<String>,
        respond_to: Respond<()>,
    },
    /// 重算聚合下载状态 + 策略评估
    SyncSeriesDownloadStatus {
        instance_id: String,
        series_id: String,
        respond_to: Respond<PolicyOutcome>,
    },

    // ---- 书目 ----
    UpsertBooks {
        instance_id: String,
        dtos: Vec<BookDto>,
        respond_to: Respond<()>,
    },
    DeleteBook {
        instance_id: String,
        book_id: String,
        respond_to: Respond<bool>,
    },
    GetBook {
        instance_id: String,
        book_id: String,
        respond_to: Respond<Option<KomgaBook>>,
    },
    FetchSeriesBookIds {
        instance_id: String,
        series_id: String,
        offset: usize,
        limit: usize,
        respond_to: Respond<Vec<String>>,
    },
    FetchBooksByIds {
        instance_id: String,
        ids: Vec<String>,
        respond_to: Respond<Vec<KomgaBook>>,
    },
    FetchPendingBooks {
        instance_id: String,
        limit: usize,
        respond_to: Respond<Vec<KomgaBook>>,
    },
    FetchDownloadedBooks {
        instance_id: String,
        respond_to: Respond<Vec<KomgaBook>>,
    },
    FetchFailedBooksCount {
        instance_id: String,
        respond_to: Respond<i64>,
    },
    GetBookDownloadStatus {
        instance_id: String,
        book_id: String,
        respond_to: Respond<DownloadStatus>,
    },
    /// 写回下载状态；可选地级联重算系列聚合 + 阅读列表计数
    UpdateBookDownloadStatus {
        instance_id: String,
        book_id: String,
        status: DownloadStatus,
        downloaded_size: Option<i64>,
        download_at: Option<DateTime<Utc>>,
        sync_series_status: bool,
        respond_to: Respond<PolicyOutcome>,
    },
    RetryFailedBooks {
        instance_id: String,
        respond_to: Respond<usize>,
    },
    CancelFailedBooks {
        instance_id: String,
        respond_to: Respond<usize>,
    },
    UpdateBookPages {
        instance_id: String,
        book_id: String,
        pages: Vec<BookPage>,
        respond_to: Respond<()>,
    },
    UpdateBookReadListIds {
        instance_id: String,
        book_id: String,
        read_list_ids: Vec<String>,
        respond_to: Respond<()>,
    },
    /// 本地写入阅读进度；record_pending 时同时写待回放记录
    UpdateReadProgress {
        instance_id: String,
        book_id: String,
        page: i64,
        completed: bool,
        position: Option<String>,
        record_pending: bool,
        respond_to: Respond<PolicyOutcome>,
    },

    // ---- 合集 ----
    UpsertCollections {
        instance_id: String,
        dtos: Vec<CollectionDto>,
        respond_to: Respond<()>,
    },
    DeleteCollection {
        instance_id: String,
        collection_id: String,
        respond_to: Respond<bool>,
    },
    GetCollection {
        instance_id: String,
        collection_id: String,
        respond_to: Respond<Option<KomgaCollection>>,
    },
    FetchCollectionIds {
        instance_id: String,
        search: Option<String>,
        sort: Sort,
        offset: usize,
        limit: usize,
        respond_to: Respond<Vec<String>>,
    },
    SetCollectionPinned {
        instance_id: String,
        collection_id: String,
        pinned: bool,
        respond_to: Respond<()>,
    },

    // ---- 阅读列表 ----
    UpsertReadLists {
        instance_id: String,
        dtos: Vec<ReadListDto>,
        respond_to: Respond<()>,
    },
    DeleteReadList {
        instance_id: String,
        read_list_id: String,
        respond_to: Respond<bool>,
    },
    GetReadList {
        instance_id: String,
        read_list_id: String,
        respond_to: Respond<Option<KomgaReadList>>,
    },
    FetchReadListIds {
        instance_id: String,
        search: Option<String>,
        sort: Sort,
        offset: usize,
        limit: usize,
        respond_to: Respond<Vec<String>>,
    },
    SetReadListPinned {
        instance_id: String,
        read_list_id: String,
        pinned: bool,
        respond_to: Respond<()>,
    },

    // ---- 库 ----
    ReplaceLibraries {
        instance_id: String,
        libraries: Vec<LibraryDto>,
        respond_to: Respond<()>,
    },
    FetchLibraries {
        instance_id: String,
        respond_to: Respond<Vec<KomgaLibrary>>,
    },

    // ---- 待回放进度 ----
    FetchPendingProgress {
        instance_id: String,
        respond_to: Respond<Vec<PendingProgress>>,
    },
    DeletePendingProgress {
        id: i64,
        respond_to: Respond<bool>,
    },

    // ---- 其他 ----
    ClearInstanceData {
        instance_id: String,
        respond_to: Respond<()>,
    },
    Shutdown,
}

/// 数据库 Actor（运行在独立线程）
pub struct DbActor {
    conn: Connection,
    receiver: Receiver<DbCommand>,
}

/// Actor 句柄：clone 共享，方法都是 async 包装
#[derive(Debug, Clone)]
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
}

impl DbActorHandle {
    /// 打开（或创建）镜像库并启动 Actor 线程
    pub fn spawn(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KMReaderError::IO(format!("创建数据库目录失败: {}", e)))?;
        }
        let mut conn = Connection::open(db_path)
            .map_err(|e| KMReaderError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;

        let (sender, receiver) = unbounded();
        let actor = DbActor { conn, receiver };
        thread::Builder::new()
            .name("kmreader-db".to_string())
            .spawn(move || actor.run())
            .map_err(|e| KMReaderError::Database(format!("启动数据库线程失败: {}", e)))?;

        info!("🚀 DbActor 已启动: {}", db_path.display());
        Ok(Self { sender })
    }

    fn send(&self, command: DbCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| KMReaderError::ShuttingDown("数据库 Actor 已停止".to_string()))
    }

    async fn request<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(Respond<T>) -> DbCommand,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| KMReaderError::ShuttingDown("数据库 Actor 未响应".to_string()))?
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(DbCommand::Shutdown);
    }

    // ---- 系列 ----

    pub async fn upsert_series_list(&self, instance_id: &str, dtos: Vec<SeriesDto>) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::UpsertSeriesList {
            instance_id,
            dtos,
            respond_to,
        })
        .await
    }

    pub async fn delete_series(&self, instance_id: &str, series_id: &str) -> Result<bool> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::DeleteSeries {
            instance_id,
            series_id,
            respond_to,
        })
        .await
    }

    pub async fn get_series(
        &self,
        instance_id: &str,
        series_id: &str,
    ) -> Result<Option<KomgaSeries>> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::GetSeries {
            instance_id,
            series_id,
            respond_to,
        })
        .await
    }

    pub async fn fetch_series_ids(
        &self,
        instance_id: &str,
        filter: SeriesFilter,
        sort: Sort,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchSeriesIds {
            instance_id,
            filter,
            sort,
            offset,
            limit,
            respond_to,
        })
        .await
    }

    pub async fn fetch_series_by_ids(
        &self,
        instance_id: &str,
        ids: Vec<String>,
    ) -> Result<Vec<KomgaSeries>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchSeriesByIds {
            instance_id,
            ids,
            respond_to,
        })
        .await
    }

    pub async fn update_series_offline_policy(
        &self,
        instance_id: &str,
        series_id: &str,
        policy: SeriesOfflinePolicy,
    ) -> Result<PolicyOutcome> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::UpdateSeriesOfflinePolicy {
            instance_id,
            series_id,
            policy,
            respond_to,
        })
        .await
    }

    pub async fn set_series_pinned(
        &self,
        instance_id: &str,
        series_id: &str,
        pinned: bool,
    ) -> Result<()> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::SetSeriesPinned {
            instance_id,
            series_id,
            pinned,
            respond_to,
        })
        .await
    }

    pub async fn update_series_collection_ids(
        &self,
        instance_id: &str,
        series_id: &str,
        collection_ids: Vec<String>,
    ) -> Result<()> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::UpdateSeriesCollectionIds {
            instance_id,
            series_id,
            collection_ids,
            respond_to,
        })
        .await
    }

    pub async fn sync_series_download_status(
        &self,
        instance_id: &str,
        series_id: &str,
    ) -> Result<PolicyOutcome> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::SyncSeriesDownloadStatus {
            instance_id,
            series_id,
            respond_to,
        })
        .await
    }

    // ---- 书目 ----

    pub async fn upsert_books(&self, instance_id: &str, dtos: Vec<BookDto>) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::UpsertBooks {
            instance_id,
            dtos,
            respond_to,
        })
        .await
    }

    pub async fn delete_book(&self, instance_id: &str, book_id: &str) -> Result<bool> {
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::DeleteBook {
            instance_id,
            book_id,
            respond_to,
        })
        .await
    }

    pub async fn get_book(&self, instance_id: &str, book_id: &str) -> Result<Option<KomgaBook>> {
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::GetBook {
            instance_id,
            book_id,
            respond_to,
        })
        .await
    }

    pub async fn fetch_series_book_ids(
        &self,
        instance_id: &str,
        series_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let (instance_id, series_id) = (instance_id.to_string(), series_id.to_string());
        self.request(move |respond_to| DbCommand::FetchSeriesBookIds {
            instance_id,
            series_id,
            offset,
            limit,
            respond_to,
        })
        .await
    }

    pub async fn fetch_books_by_ids(
        &self,
        instance_id: &str,
        ids: Vec<String>,
    ) -> Result<Vec<KomgaBook>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchBooksByIds {
            instance_id,
            ids,
            respond_to,
        })
        .await
    }

    pub async fn fetch_pending_books(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<KomgaBook>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchPendingBooks {
            instance_id,
            limit,
            respond_to,
        })
        .await
    }

    pub async fn fetch_downloaded_books(&self, instance_id: &str) -> Result<Vec<KomgaBook>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchDownloadedBooks {
            instance_id,
            respond_to,
        })
        .await
    }

    pub async fn fetch_failed_books_count(&self, instance_id: &str) -> Result<i64> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchFailedBooksCount {
            instance_id,
            respond_to,
        })
        .await
    }

    pub async fn get_book_download_status(
        &self,
        instance_id: &str,
        book_id: &str,
    ) -> Result<DownloadStatus> {
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::GetBookDownloadStatus {
            instance_id,
            book_id,
            respond_to,
        })
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
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::UpdateBookDownloadStatus {
            instance_id,
            book_id,
            status,
            downloaded_size,
            download_at,
            sync_series_status,
            respond_to,
        })
        .await
    }

    pub async fn retry_failed_books(&self, instance_id: &str) -> Result<usize> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::RetryFailedBooks {
            instance_id,
            respond_to,
        })
        .await
    }

    pub async fn cancel_failed_books(&self, instance_id: &str) -> Result<usize> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::CancelFailedBooks {
            instance_id,
            respond_to,
        })
        .await
    }

    pub async fn update_book_pages(
        &self,
        instance_id: &str,
        book_id: &str,
        pages: Vec<BookPage>,
    ) -> Result<()> {
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::UpdateBookPages {
            instance_id,
            book_id,
            pages,
            respond_to,
        })
        .await
    }

    pub async fn update_book_read_list_ids(
        &self,
        instance_id: &str,
        book_id: &str,
        read_list_ids: Vec<String>,
    ) -> Result<()> {
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::UpdateBookReadListIds {
            instance_id,
            book_id,
            read_list_ids,
            respond_to,
        })
        .await
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
        let (instance_id, book_id) = (instance_id.to_string(), book_id.to_string());
        self.request(move |respond_to| DbCommand::UpdateReadProgress {
            instance_id,
            book_id,
            page,
            completed,
            position,
            record_pending,
            respond_to,
        })
        .await
    }

    // ---- 合集 ----

    pub async fn upsert_collections(
        &self,
        instance_id: &str,
        dtos: Vec<CollectionDto>,
    ) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::UpsertCollections {
            instance_id,
            dtos,
            respond_to,
        })
        .await
    }

    pub async fn delete_collection(&self, instance_id: &str, collection_id: &str) -> Result<bool> {
        let (instance_id, collection_id) = (instance_id.to_string(), collection_id.to_string());
        self.request(move |respond_to| DbCommand::DeleteCollection {
            instance_id,
            collection_id,
            respond_to,
        })
        .await
    }

    pub async fn get_collection(
        &self,
        instance_id: &str,
        collection_id: &str,
    ) -> Result<Option<KomgaCollection>> {
        let (instance_id, collection_id) = (instance_id.to_string(), collection_id.to_string());
        self.request(move |respond_to| DbCommand::GetCollection {
            instance_id,
            collection_id,
            respond_to,
        })
        .await
    }

    pub async fn fetch_collection_ids(
        &self,
        instance_id: &str,
        search: Option<String>,
        sort: Sort,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchCollectionIds {
            instance_id,
            search,
            sort,
            offset,
            limit,
            respond_to,
        })
        .await
    }

    pub async fn set_collection_pinned(
        &self,
        instance_id: &str,
        collection_id: &str,
        pinned: bool,
    ) -> Result<()> {
        let (instance_id, collection_id) = (instance_id.to_string(), collection_id.to_string());
        self.request(move |respond_to| DbCommand::SetCollectionPinned {
            instance_id,
            collection_id,
            pinned,
            respond_to,
        })
        .await
    }

    // ---- 阅读列表 ----

    pub async fn upsert_read_lists(
        &self,
        instance_id: &str,
        dtos: Vec<ReadListDto>,
    ) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::UpsertReadLists {
            instance_id,
            dtos,
            respond_to,
        })
        .await
    }

    pub async fn delete_read_list(&self, instance_id: &str, read_list_id: &str) -> Result<bool> {
        let (instance_id, read_list_id) = (instance_id.to_string(), read_list_id.to_string());
        self.request(move |respond_to| DbCommand::DeleteReadList {
            instance_id,
            read_list_id,
            respond_to,
        })
        .await
    }

    pub async fn get_read_list(
        &self,
        instance_id: &str,
        read_list_id: &str,
    ) -> Result<Option<KomgaReadList>> {
        let (instance_id, read_list_id) = (instance_id.to_string(), read_list_id.to_string());
        self.request(move |respond_to| DbCommand::GetReadList {
            instance_id,
            read_list_id,
            respond_to,
        })
        .await
    }

    pub async fn fetch_read_list_ids(
        &self,
        instance_id: &str,
        search: Option<String>,
        sort: Sort,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchReadListIds {
            instance_id,
            search,
            sort,
            offset,
            limit,
            respond_to,
        })
        .await
    }

    pub async fn set_read_list_pinned(
        &self,
        instance_id: &str,
        read_list_id: &str,
        pinned: bool,
    ) -> Result<()> {
        let (instance_id, read_list_id) = (instance_id.to_string(), read_list_id.to_string());
        self.request(move |respond_to| DbCommand::SetReadListPinned {
            instance_id,
            read_list_id,
            pinned,
            respond_to,
        })
        .await
    }

    // ---- 库 ----

    pub async fn replace_libraries(
        &self,
        instance_id: &str,
        libraries: Vec<LibraryDto>,
    ) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::ReplaceLibraries {
            instance_id,
            libraries,
            respond_to,
        })
        .await
    }

    pub async fn fetch_libraries(&self, instance_id: &str) -> Result<Vec<KomgaLibrary>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchLibraries {
            instance_id,
            respond_to,
        })
        .await
    }

    // ---- 待回放进度 ----

    pub async fn fetch_pending_progress(&self, instance_id: &str) -> Result<Vec<PendingProgress>> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::FetchPendingProgress {
            instance_id,
            respond_to,
        })
        .await
    }

    pub async fn delete_pending_progress(&self, id: i64) -> Result<bool> {
        self.request(move |respond_to| DbCommand::DeletePendingProgress { id, respond_to })
            .await
    }

    // ---- 其他 ----

    pub async fn clear_instance_data(&self, instance_id: &str) -> Result<()> {
        let instance_id = instance_id.to_string();
        self.request(move |respond_to| DbCommand::ClearInstanceData {
            instance_id,
            respond_to,
        })
        .await
    }
}

impl DbActor {
    /// 运行 Actor 主循环
    fn run(self) {
        debug!("🔄 DbActor 开始处理命令");
        while let Ok(command) = self.receiver.recv() {
            match command {
                DbCommand::Shutdown => {
                    info!("🛑 DbActor 收到停止信号");
                    break;
                }
                DbCommand::UpsertSeriesList {
                    instance_id,
                    dtos,
                    respond_to,
                } => {
                    let result = SeriesDao::new(&self.conn).upsert_list(&instance_id, &dtos);
                    let _ = respond_to.send(result);
                }
                DbCommand::DeleteSeries {
                    instance_id,
                    series_id,
                    respond_to,
                } => {
                    let result = SeriesDao::new(&self.conn).delete(&instance_id, &series_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::GetSeries {
                    instance_id,
                    series_id,
                    respond_to,
                } => {
                    let result = SeriesDao::new(&self.conn).get(&instance_id, &series_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchSeriesIds {
                    instance_id,
                    filter,
                    sort,
                    offset,
                    limit,
                    respond_to,
                } => {
                    let result = SeriesDao::new(&self.conn)
                        .fetch_ids(&instance_id, &filter, &sort, offset, limit);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchSeriesByIds {
                    instance_id,
                    ids,
                    respond_to,
                } => {
                    let result = SeriesDao::new(&self.conn).fetch_by_ids(&instance_id, &ids);
                    let _ = respond_to.send(result);
                }
                DbCommand::UpdateSeriesOfflinePolicy {
                    instance_id,
                    series_id,
                    policy,
                    respond_to,
                } => {
                    let result = self.handle_update_offline_policy(&instance_id, &series_id, policy);
                    let _ = respond_to.send(result);
                }
                DbCommand::SetSeriesPinned {
                    instance_id,
                    series_id,
                    pinned,
                    respond_to,
                } => {
                    let result =
                        SeriesDao::new(&self.conn).set_pinned(&instance_id, &series_id, pinned);
                    let _ = respond_to.send(result);
                }
                DbCommand::UpdateSeriesCollectionIds {
                    instance_id,
                    series_id,
                    collection_ids,
                    respond_to,
                } => {
                    let result = SeriesDao::new(&self.conn).update_collection_ids(
                        &instance_id,
                        &series_id,
                        &collection_ids,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::SyncSeriesDownloadStatus {
                    instance_id,
                    series_id,
                    respond_to,
                } => {
                    let result = self.handle_sync_series_download_status(&instance_id, &series_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::UpsertBooks {
                    instance_id,
                    dtos,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).upsert_list(&instance_id, &dtos);
                    let _ = respond_to.send(result);
                }
                DbCommand::DeleteBook {
                    instance_id,
                    book_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).delete(&instance_id, &book_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::GetBook {
                    instance_id,
                    book_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).get(&instance_id, &book_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchSeriesBookIds {
                    instance_id,
                    series_id,
                    offset,
                    limit,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn)
                        .fetch_series_book_ids(&instance_id, &series_id, offset, limit);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchBooksByIds {
                    instance_id,
                    ids,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).fetch_by_ids(&instance_id, &ids);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchPendingBooks {
                    instance_id,
                    limit,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).fetch_pending(&instance_id, limit);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchDownloadedBooks {
                    instance_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).fetch_downloaded(&instance_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchFailedBooksCount {
                    instance_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).failed_count(&instance_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::GetBookDownloadStatus {
                    instance_id,
                    book_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).download_status(&instance_id, &book_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::UpdateBookDownloadStatus {
                    instance_id,
                    book_id,
                    status,
                    downloaded_size,
                    download_at,
                    sync_series_status,
                    respond_to,
                } => {
                    let result = self.handle_update_book_download_status(
                        &instance_id,
                        &book_id,
                        status,
                        downloaded_size,
                        download_at,
                        sync_series_status,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::RetryFailedBooks {
                    instance_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).retry_failed(&instance_id, Utc::now());
                    let _ = respond_to.send(result);
                }
                DbCommand::CancelFailedBooks {
                    instance_id,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).cancel_failed(&instance_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::UpdateBookPages {
                    instance_id,
                    book_id,
                    pages,
                    respond_to,
                } => {
                    let result =
                        BookDao::new(&self.conn).update_pages(&instance_id, &book_id, &pages);
                    let _ = respond_to.send(result);
                }
                DbCommand::UpdateBookReadListIds {
                    instance_id,
                    book_id,
                    read_list_ids,
                    respond_to,
                } => {
                    let result = BookDao::new(&self.conn).update_read_list_ids(
                        &instance_id,
                        &book_id,
                        &read_list_ids,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::UpdateReadProgress {
                    instance_id,
                    book_id,
                    page,
                    completed,
                    position,
                    record_pending,
                    respond_to,
                } => {
                    let result = self.handle_update_read_progress(
                        &instance_id,
                        &book_id,
                        page,
                        completed,
                        position.as_deref(),
                        record_pending,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::UpsertCollections {
                    instance_id,
                    dtos,
                    respond_to,
                } => {
                    let result = CollectionDao::new(&self.conn).upsert_list(&instance_id, &dtos);
                    let _ = respond_to.send(result);
                }
                DbCommand::DeleteCollection {
                    instance_id,
                    collection_id,
                    respond_to,
                } => {
                    let result =
                        CollectionDao::new(&self.conn).delete(&instance_id, &collection_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::GetCollection {
                    instance_id,
                    collection_id,
                    respond_to,
                } => {
                    let result = CollectionDao::new(&self.conn).get(&instance_id, &collection_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchCollectionIds {
                    instance_id,
                    search,
                    sort,
                    offset,
                    limit,
                    respond_to,
                } => {
                    let result = CollectionDao::new(&self.conn).fetch_ids(
                        &instance_id,
                        search.as_deref(),
                        &sort,
                        offset,
                        limit,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::SetCollectionPinned {
                    instance_id,
                    collection_id,
                    pinned,
                    respond_to,
                } => {
                    let result = CollectionDao::new(&self.conn).set_pinned(
                        &instance_id,
                        &collection_id,
                        pinned,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::UpsertReadLists {
                    instance_id,
                    dtos,
                    respond_to,
                } => {
                    let result = ReadListDao::new(&self.conn).upsert_list(&instance_id, &dtos);
                    let _ = respond_to.send(result);
                }
                DbCommand::DeleteReadList {
                    instance_id,
                    read_list_id,
                    respond_to,
                } => {
                    let result = ReadListDao::new(&self.conn).delete(&instance_id, &read_list_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::GetReadList {
                    instance_id,
                    read_list_id,
                    respond_to,
                } => {
                    let result = ReadListDao::new(&self.conn).get(&instance_id, &read_list_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchReadListIds {
                    instance_id,
                    search,
                    sort,
                    offset,
                    limit,
                    respond_to,
                } => {
                    let result = ReadListDao::new(&self.conn).fetch_ids(
                        &instance_id,
                        search.as_deref(),
                        &sort,
                        offset,
                        limit,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::SetReadListPinned {
                    instance_id,
                    read_list_id,
                    pinned,
                    respond_to,
                } => {
                    let result = ReadListDao::new(&self.conn).set_pinned(
                        &instance_id,
                        &read_list_id,
                        pinned,
                    );
                    let _ = respond_to.send(result);
                }
                DbCommand::ReplaceLibraries {
                    instance_id,
                    libraries,
                    respond_to,
                } => {
                    let result = LibraryDao::new(&self.conn).replace_all(&instance_id, &libraries);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchLibraries {
                    instance_id,
                    respond_to,
                } => {
                    let result = LibraryDao::new(&self.conn).fetch(&instance_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::FetchPendingProgress {
                    instance_id,
                    respond_to,
                } => {
                    let result = PendingProgressDao::new(&self.conn).list(&instance_id);
                    let _ = respond_to.send(result);
                }
                DbCommand::DeletePendingProgress { id, respond_to } => {
                    let result = PendingProgressDao::new(&self.conn).delete(id);
                    let _ = respond_to.send(result);
                }
                DbCommand::ClearInstanceData {
                    instance_id,
                    respond_to,
                } => {
                    let result = self.handle_clear_instance_data(&instance_id);
                    let _ = respond_to.send(result);
                }
            }
        }
        info!("✅ DbActor 已停止");
    }

    /// 处理：写回书目下载状态并级联重算派生视图
    fn handle_update_book_download_status(
        &self,
        instance_id: &str,
        book_id: &str,
        status: DownloadStatus,
        downloaded_size: Option<i64>,
        download_at: Option<DateTime<Utc>>,
        sync_series_status: bool,
    ) -> Result<PolicyOutcome> {
        let book_dao = BookDao::new(&self.conn);
        let Some(book) = book_dao.get(instance_id, book_id)? else {
            debug!("书目不存在，跳过状态更新: {}", book_id);
            return Ok(PolicyOutcome::default());
        };

        if matches!(status, DownloadStatus::NotDownloaded) {
            book_dao.reset_download_state(instance_id, book_id)?;
        } else {
            book_dao.update_download_status(
                instance_id,
                book_id,
                &status,
                downloaded_size,
                download_at,
            )?;
        }

        self.recompute_read_list_counters(instance_id, book_id)?;

        if sync_series_status {
            self.handle_sync_series_download_status(instance_id, &book.series_id)
        } else {
            Ok(PolicyOutcome::default())
        }
    }

    /// 处理：本地阅读进度写入（可选写待回放记录），随后做策略评估
    fn handle_update_read_progress(
        &self,
        instance_id: &str,
        book_id: &str,
        page: i64,
        completed: bool,
        position: Option<&str>,
        record_pending: bool,
    ) -> Result<PolicyOutcome> {
        let book_dao = BookDao::new(&self.conn);
        let Some(book) = book_dao.get(instance_id, book_id)? else {
            return Err(KMReaderError::NotFound(format!("book {}", book_id)));
        };

        let now = Utc::now();
        book_dao.update_read_progress(instance_id, book_id, page, completed, now)?;
        if record_pending {
            PendingProgressDao::new(&self.conn)
                .upsert(instance_id, book_id, page, completed, position, now)?;
        }

        // 阅读进度变化是 cleanupRead 策略的触发点之一
        self.handle_sync_series_download_status(instance_id, &book.series_id)
    }

    /// 处理：策略变更后立即重算 + 评估
    fn handle_update_offline_policy(
        &self,
        instance_id: &str,
        series_id: &str,
        policy: SeriesOfflinePolicy,
    ) -> Result<PolicyOutcome> {
        let updated =
            SeriesDao::new(&self.conn).update_offline_policy(instance_id, series_id, policy)?;
        if !updated {
            return Ok(PolicyOutcome::default());
        }
        self.handle_sync_series_download_status(instance_id, series_id)
    }

    /// 处理：扫描成员书目，重算聚合状态并执行策略动作
    fn handle_sync_series_download_status(
        &self,
        instance_id: &str,
        series_id: &str,
    ) -> Result<PolicyOutcome> {
        let series_dao = SeriesDao::new(&self.conn);
        let book_dao = BookDao::new(&self.conn);

        let Some(series) = series_dao.get(instance_id, series_id)? else {
            return Ok(PolicyOutcome::default());
        };
        let books = book_dao.fetch_for_series(instance_id, series_id)?;

        let mut outcome = PolicyOutcome::default();

        // 策略评估（聚合重算前：本轮标记的 pending 也应计入聚合）
        let policy = series.local.offline_policy;
        if policy != SeriesOfflinePolicy::Manual {
            for book in &books {
                let is_downloaded = matches!(book.download.status, DownloadStatus::Downloaded);
                let is_pending = matches!(book.download.status, DownloadStatus::Pending);
                let is_failed = matches!(book.download.status, DownloadStatus::Failed(_));

                let should_be_offline = match policy {
                    SeriesOfflinePolicy::Manual => is_downloaded || is_pending,
                    SeriesOfflinePolicy::UnreadOnly
                    | SeriesOfflinePolicy::UnreadOnlyAndCleanupRead => !book.is_read(),
                    SeriesOfflinePolicy::All => true,
                };

                if should_be_offline {
                    // failed 不自动复活，重试只走显式入口
                    if !is_downloaded && !is_pending && !is_failed {
                        book_dao.update_download_status(
                            instance_id,
                            &book.book_id,
                            &DownloadStatus::Pending,
                            None,
                            Some(Utc::now()),
                        )?;
                        outcome.queued_book_ids.push(book.book_id.clone());
                    }
                } else if (is_downloaded || is_pending)
                    && policy == SeriesOfflinePolicy::UnreadOnlyAndCleanupRead
                {
                    outcome.cleanup_book_ids.push(book.book_id.clone());
                }
            }
        }

        // 聚合重算（读取策略评估后的最新状态）
        let books = book_dao.fetch_for_series(instance_id, series_id)?;
        let downloaded = books
            .iter()
            .filter(|b| matches!(b.download.status, DownloadStatus::Downloaded))
            .count() as i64;
        let pending = books
            .iter()
            .filter(|b| matches!(b.download.status, DownloadStatus::Pending))
            .count() as i64;
        let downloaded_size: i64 = books.iter().map(|b| b.download.downloaded_size).sum();
        let download_at = books.iter().filter_map(|b| b.download.download_at).max();

        let status = SeriesDownloadStatus::from_counts(downloaded, pending, series.books_count);
        series_dao.update_download_aggregates(
            instance_id,
            series_id,
            status,
            downloaded,
            pending,
            downloaded_size,
            download_at,
        )?;
        outcome.status = Some(status);

        if outcome.needs_queue_kick() || !outcome.cleanup_book_ids.is_empty() {
            debug!(
                "策略评估 series={}: 入队 {} 本, 清理 {} 本",
                series_id,
                outcome.queued_book_ids.len(),
                outcome.cleanup_book_ids.len()
            );
        }
        Ok(outcome)
    }

    /// 重算包含该书的所有阅读列表的派生下载计数
    fn recompute_read_list_counters(&self, instance_id: &str, book_id: &str) -> Result<()> {
        let read_list_dao = ReadListDao::new(&self.conn);
        let book_dao = BookDao::new(&self.conn);

        for list in read_list_dao.fetch_containing_book(instance_id, book_id)? {
            let members = book_dao.fetch_by_ids(instance_id, &list.book_ids)?;
            let downloaded = members
                .iter()
                .filter(|b| matches!(b.download.status, DownloadStatus::Downloaded))
                .count() as i64;
            let pending = members
                .iter()
                .filter(|b| matches!(b.download.status, DownloadStatus::Pending))
                .count() as i64;
            let size: i64 = members.iter().map(|b| b.download.downloaded_size).sum();
            read_list_dao.update_download_counters(
                instance_id,
                &list.read_list_id,
                downloaded,
                pending,
                size,
            )?;
        }
        Ok(())
    }

    /// 处理：清空一个实例的全部镜像数据
    fn handle_clear_instance_data(&self, instance_id: &str) -> Result<()> {
        SeriesDao::new(&self.conn).clear_instance(instance_id)?;
        BookDao::new(&self.conn).clear_instance(instance_id)?;
        CollectionDao::new(&self.conn).clear_instance(instance_id)?;
        ReadListDao::new(&self.conn).clear_instance(instance_id)?;
        LibraryDao::new(&self.conn).clear_instance(instance_id)?;
        PendingProgressDao::new(&self.conn).clear_instance(instance_id)?;
        if let Err(e) = self.conn.execute_batch("VACUUM") {
            error!("VACUUM 失败: {}", e);
        }
        info!("🗑️ 实例数据已清空: {}", instance_id);
        Ok(())
    }
}
