//! 同步引擎 - 分页拉取 + 幂等 upsert
//!
//! 所有操作共享同一契约：从网关拉一页，按复合主键整体覆盖写入
//! 本地镜像，返回页内容与 last 标记。重复执行产生相同的本地状态，
//! 网络失败后重跑是安全的。
//!
//! ## NOTE: 引擎不做重试
//!
//! 重试/退避策略属于调用方：分页加载静默回退本地数据，
//! 用户主动刷新才把错误暴露出去。

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{KMReaderError, Result};
use crate::events::{EventBus, StoreEvent};
use crate::gateway::{
    BookDto, CollectionDto, Gateway, Page, ReadListDto, SeriesDto, SeriesPageQuery,
};
use crate::storage::MirrorStore;

/// 全量循环同步的每页大小
const FULL_SYNC_PAGE_SIZE: usize = 500;

/// 同步引擎
pub struct SyncEngine {
    gateway: Arc<dyn Gateway>,
    store: MirrorStore,
    events: EventBus,
    page_size: usize,
}

impl SyncEngine {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: MirrorStore,
        events: EventBus,
        page_size: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            events,
            page_size,
        }
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// 登录后的整体同步：库 + 合集 + 阅读列表。
    /// 单项失败只记日志，不中断其余部分。
    pub async fn sync_all(&self, instance_id: &str) {
        info!("🔄 开始全量同步: {}", instance_id);
        if let Err(e) = self.sync_libraries(instance_id).await {
            debug!("同步库失败: {}", e);
        }
        if let Err(e) = self.sync_collections(instance_id).await {
            debug!("同步合集失败: {}", e);
        }
        if let Err(e) = self.sync_read_lists(instance_id).await {
            debug!("同步阅读列表失败: {}", e);
        }
        info!("✅ 全量同步完成: {}", instance_id);
    }

    // ---- 库 ----

    pub async fn sync_libraries(&self, instance_id: &str) -> Result<usize> {
        let libraries = self.gateway.libraries().await?;
        let count = libraries.len();
        self.store.replace_libraries(instance_id, libraries).await?;
        self.events.publish(StoreEvent::LibrariesChanged {
            instance_id: instance_id.to_string(),
        });
        info!("📚 已同步 {} 个库", count);
        Ok(count)
    }

    // ---- 系列 ----

    /// 按过滤/排序拉一页系列并写入镜像
    pub async fn sync_series_page(
        &self,
        instance_id: &str,
        query: &SeriesPageQuery,
    ) -> Result<Page<SeriesDto>> {
        let page = self.gateway.series_page(query).await?;
        self.store
            .upsert_series_list(instance_id, page.content.clone())
            .await?;
        Ok(page)
    }

    pub async fn sync_new_series(
        &self,
        instance_id: &str,
        library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        let result = self.gateway.new_series_page(library_ids, page, size).await?;
        self.store
            .upsert_series_list(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    pub async fn sync_updated_series(
        &self,
        instance_id: &str,
        library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        let result = self
            .gateway
            .updated_series_page(library_ids, page, size)
            .await?;
        self.store
            .upsert_series_list(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    /// 单系列详情；服务端 404 视为已删除：清掉本地行后把错误继续抛出
    pub async fn sync_series_detail(
        &self,
        instance_id: &str,
        series_id: &str,
    ) -> Result<SeriesDto> {
        match self.gateway.series(series_id).await {
            Ok(dto) => {
                self.store
                    .upsert_series_list(instance_id, vec![dto.clone()])
                    .await?;
                self.events.publish(StoreEvent::SeriesChanged {
                    instance_id: instance_id.to_string(),
                    series_id: series_id.to_string(),
                });
                Ok(dto)
            }
            Err(e) if e.is_not_found() => {
                self.store.delete_series(instance_id, series_id).await?;
                self.events.publish(StoreEvent::SeriesDeleted {
                    instance_id: instance_id.to_string(),
                    series_id: series_id.to_string(),
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // ---- 书目 ----

    pub async fn sync_series_books_page(
        &self,
        instance_id: &str,
        series_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>> {
        let result = self
            .gateway
            .series_books_page(series_id, page, size)
            .await?;
        self.store
            .upsert_books(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    /// 一个系列的全部书目（策略操作前置步骤）
    pub async fn sync_all_series_books(&self, instance_id: &str, series_id: &str) -> Result<usize> {
        let mut page = 0;
        let mut total = 0;
        loop {
            let result = self
                .sync_series_books_page(instance_id, series_id, page, self.page_size)
                .await?;
            total += result.content.len();
            if result.last {
                break;
            }
            page += 1;
        }
        info!("📚 已同步系列 {} 的 {} 本书", series_id, total);
        Ok(total)
    }

    pub async fn sync_book(&self, instance_id: &str, book_id: &str) -> Result<BookDto> {
        match self.gateway.book(book_id).await {
            Ok(dto) => {
                self.store
                    .upsert_books(instance_id, vec![dto.clone()])
                    .await?;
                self.events.publish(StoreEvent::BookChanged {
                    instance_id: instance_id.to_string(),
                    book_id: book_id.to_string(),
                    series_id: dto.series_id.clone(),
                });
                Ok(dto)
            }
            Err(e) if e.is_not_found() => {
                self.store.delete_book(instance_id, book_id).await?;
                self.events.publish(StoreEvent::BookDeleted {
                    instance_id: instance_id.to_string(),
                    book_id: book_id.to_string(),
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 书与所属系列并发拉取，一次写入
    pub async fn sync_book_and_series(
        &self,
        instance_id: &str,
        book_id: &str,
        series_id: &str,
    ) -> Result<()> {
        let (book, series) =
            tokio::try_join!(self.gateway.book(book_id), self.gateway.series(series_id))?;
        self.store.upsert_books(instance_id, vec![book]).await?;
        self.store
            .upsert_series_list(instance_id, vec![series])
            .await?;
        self.events.publish(StoreEvent::BookChanged {
            instance_id: instance_id.to_string(),
            book_id: book_id.to_string(),
            series_id: series_id.to_string(),
        });
        Ok(())
    }

    // ---- 合集 ----

    pub async fn sync_collections_page(
        &self,
        instance_id: &str,
        page: usize,
        size: usize,
        search: Option<&str>,
    ) -> Result<Page<CollectionDto>> {
        let result = self.gateway.collections_page(page, size, search).await?;
        self.store
            .upsert_collections(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    /// 全部合集（循环翻页直到 last）
    pub async fn sync_collections(&self, instance_id: &str) -> Result<usize> {
        let mut page = 0;
        let mut total = 0;
        loop {
            let result = self
                .sync_collections_page(instance_id, page, FULL_SYNC_PAGE_SIZE, None)
                .await?;
            total += result.content.len();
            if result.last {
                break;
            }
            page += 1;
        }
        info!("📂 已同步 {} 个合集", total);
        Ok(total)
    }

    pub async fn sync_collection(
        &self,
        instance_id: &str,
        collection_id: &str,
    ) -> Result<CollectionDto> {
        match self.gateway.collection(collection_id).await {
            Ok(dto) => {
                self.store
                    .upsert_collections(instance_id, vec![dto.clone()])
                    .await?;
                self.events.publish(StoreEvent::CollectionChanged {
                    instance_id: instance_id.to_string(),
                    collection_id: collection_id.to_string(),
                });
                Ok(dto)
            }
            Err(e) if e.is_not_found() => {
                self.store
                    .delete_collection(instance_id, collection_id)
                    .await?;
                self.events.publish(StoreEvent::CollectionDeleted {
                    instance_id: instance_id.to_string(),
                    collection_id: collection_id.to_string(),
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// 合集成员系列分页
    pub async fn sync_collection_series(
        &self,
        instance_id: &str,
        collection_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        let result = self
            .gateway
            .collection_series_page(collection_id, page, size)
            .await?;
        self.store
            .upsert_series_list(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    // ---- 阅读列表 ----

    pub async fn sync_read_lists_page(
        &self,
        instance_id: &str,
        page: usize,
        size: usize,
        search: Option<&str>,
    ) -> Result<Page<ReadListDto>> {
        let result = self.gateway.read_lists_page(page, size, search).await?;
        self.store
            .upsert_read_lists(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    /// 全部阅读列表（循环翻页直到 last）
    pub async fn sync_read_lists(&self, instance_id: &str) -> Result<usize> {
        let mut page = 0;
        let mut total = 0;
        loop {
            let result = self
                .sync_read_lists_page(instance_id, page, FULL_SYNC_PAGE_SIZE, None)
                .await?;
            total += result.content.len();
            if result.last {
                break;
            }
            page += 1;
        }
        info!("📖 已同步 {} 个阅读列表", total);
        Ok(total)
    }

    pub async fn sync_read_list(
        &self,
        instance_id: &str,
        read_list_id: &str,
    ) -> Result<ReadListDto> {
        match self.gateway.read_list(read_list_id).await {
            Ok(dto) => {
                self.store
                    .upsert_read_lists(instance_id, vec![dto.clone()])
                    .await?;
                self.events.publish(StoreEvent::ReadListChanged {
                    instance_id: instance_id.to_string(),
                    read_list_id: read_list_id.to_string(),
                });
                Ok(dto)
            }
            Err(e) if e.is_not_found() => {
                self.store
                    .delete_read_list(instance_id, read_list_id)
                    .await?;
                self.events.publish(StoreEvent::ReadListDeleted {
                    instance_id: instance_id.to_string(),
                    read_list_id: read_list_id.to_string(),
                });
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn sync_read_list_books_page(
        &self,
        instance_id: &str,
        read_list_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>> {
        let result = self
            .gateway
            .read_list_books_page(read_list_id, page, size)
            .await?;
        self.store
            .upsert_books(instance_id, result.content.clone())
            .await?;
        Ok(result)
    }

    /// 一个阅读列表的全部书目（策略操作前置步骤）
    pub async fn sync_all_read_list_books(
        &self,
        instance_id: &str,
        read_list_id: &str,
    ) -> Result<usize> {
        let mut page = 0;
        let mut total = 0;
        loop {
            let result = self
                .sync_read_list_books_page(instance_id, read_list_id, page, self.page_size)
                .await?;
            total += result.content.len();
            if result.last {
                break;
            }
            page += 1;
        }
        info!("📖 已同步阅读列表 {} 的 {} 本书", read_list_id, total);
        Ok(total)
    }

    /// 404 以外的错误是否应该提示用户：只有显式刷新且没有本地数据可回退时
    pub fn should_surface_error(error: &KMReaderError, user_initiated: bool, has_cached: bool) -> bool {
        if !user_initiated {
            return false;
        }
        if has_cached {
            return false;
        }
        !matches!(error, KMReaderError::Cancelled)
    }
}
