//! 集成测试公共设施：内存版网关 mock 与实体构造器

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use kmreader_sdk::gateway::{
    BookDto, BookMetadataDto, CollectionDto, Gateway, LibraryDto, MediaDto, Page, ReadListDto,
    ReadProgressDto, SeriesDto, SeriesMetadataDto, SeriesPageQuery,
};
use kmreader_sdk::storage::entities::BookPage;
use kmreader_sdk::{KMReaderError, Result};

/// 初始化测试日志（重复调用安全）
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 内存网关：数据注入 + 故障开关 + 调用记录
#[derive(Default)]
pub struct MockGateway {
    pub series: Mutex<HashMap<String, SeriesDto>>,
    pub books: Mutex<HashMap<String, BookDto>>,
    pub collections: Mutex<HashMap<String, CollectionDto>>,
    pub read_lists: Mutex<HashMap<String, ReadListDto>>,
    pub libraries: Mutex<Vec<LibraryDto>>,
    pub pages: Mutex<HashMap<String, Vec<BookPage>>>,
    /// 进度上报调用记录 (book_id, page, completed)
    pub progress_calls: Mutex<Vec<(String, i64, bool)>>,
    /// 打开 = 所有网络调用失败
    pub fail_network: AtomicBool,
    /// 打开 = 进度上报失败（其余正常）
    pub fail_progress: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_network_failing(&self, failing: bool) {
        self.fail_network.store(failing, Ordering::SeqCst);
    }

    pub fn set_progress_failing(&self, failing: bool) {
        self.fail_progress.store(failing, Ordering::SeqCst);
    }

    pub fn insert_series(&self, dto: SeriesDto) {
        self.series.lock().unwrap().insert(dto.id.clone(), dto);
    }

    pub fn insert_book(&self, dto: BookDto, pages: Vec<BookPage>) {
        self.pages.lock().unwrap().insert(dto.id.clone(), pages);
        self.books.lock().unwrap().insert(dto.id.clone(), dto);
    }

    pub fn remove_book(&self, book_id: &str) {
        self.books.lock().unwrap().remove(book_id);
    }

    pub fn remove_series(&self, series_id: &str) {
        self.series.lock().unwrap().remove(series_id);
    }

    fn check_network(&self) -> Result<()> {
        if self.fail_network.load(Ordering::SeqCst) {
            return Err(KMReaderError::Transport("mock: network down".to_string()));
        }
        Ok(())
    }

    fn paginate<T: Clone>(mut items: Vec<T>, page: usize, size: usize) -> Page<T> {
        let start = page * size;
        let end = (start + size).min(items.len());
        let last = end >= items.len();
        let content = if start >= items.len() {
            Vec::new()
        } else {
            items.drain(start..end).collect()
        };
        Page::new(content, last)
    }

    fn not_found(what: &str) -> KMReaderError {
        KMReaderError::from_status(404, format!("http://mock/{}", what), "")
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn libraries(&self) -> Result<Vec<LibraryDto>> {
        self.check_network()?;
        Ok(self.libraries.lock().unwrap().clone())
    }

    async fn series_page(&self, query: &SeriesPageQuery) -> Result<Page<SeriesDto>> {
        self.check_network()?;
        let mut all: Vec<SeriesDto> = self.series.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        if !query.library_ids.is_empty() {
            all.retain(|s| query.library_ids.contains(&s.library_id));
        }
        if let Some(search) = &query.search {
            all.retain(|s| s.name.contains(search.as_str()));
        }
        Ok(Self::paginate(all, query.page, query.size))
    }

    async fn new_series_page(
        &self,
        _library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        self.check_network()?;
        let mut all: Vec<SeriesDto> = self.series.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(Self::paginate(all, page, size))
    }

    async fn updated_series_page(
        &self,
        _library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        self.check_network()?;
        let mut all: Vec<SeriesDto> = self.series.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(Self::paginate(all, page, size))
    }

    async fn series(&self, series_id: &str) -> Result<SeriesDto> {
        self.check_network()?;
        self.series
            .lock()
            .unwrap()
            .get(series_id)
            .cloned()
            .ok_or_else(|| Self::not_found(series_id))
    }

    async fn series_books_page(
        &self,
        series_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>> {
        self.check_network()?;
        let mut books: Vec<BookDto> = self
            .books
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.series_id == series_id)
            .cloned()
            .collect();
        books.sort_by(|a, b| {
            a.metadata
                .number_sort
                .partial_cmp(&b.metadata.number_sort)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(Self::paginate(books, page, size))
    }

    async fn book(&self, book_id: &str) -> Result<BookDto> {
        self.check_network()?;
        self.books
            .lock()
            .unwrap()
            .get(book_id)
            .cloned()
            .ok_or_else(|| Self::not_found(book_id))
    }

    async fn collections_page(
        &self,
        page: usize,
        size: usize,
        _search: Option<&str>,
    ) -> Result<Page<CollectionDto>> {
        self.check_network()?;
        let mut all: Vec<CollectionDto> =
            self.collections.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self::paginate(all, page, size))
    }

    async fn collection(&self, collection_id: &str) -> Result<CollectionDto> {
        self.check_network()?;
        self.collections
            .lock()
            .unwrap()
            .get(collection_id)
            .cloned()
            .ok_or_else(|| Self::not_found(collection_id))
    }

    async fn collection_series_page(
        &self,
        collection_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        self.check_network()?;
        let member_ids = self
            .collections
            .lock()
            .unwrap()
            .get(collection_id)
            .map(|c| c.series_ids.clone())
            .ok_or_else(|| Self::not_found(collection_id))?;
        let series = self.series.lock().unwrap();
        let members: Vec<SeriesDto> = member_ids
            .iter()
            .filter_map(|id| series.get(id).cloned())
            .collect();
        Ok(Self::paginate(members, page, size))
    }

    async fn read_lists_page(
        &self,
        page: usize,
        size: usize,
        _search: Option<&str>,
    ) -> Result<Page<ReadListDto>> {
        self.check_network()?;
        let mut all: Vec<ReadListDto> =
            self.read_lists.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self::paginate(all, page, size))
    }

    async fn read_list(&self, read_list_id: &str) -> Result<ReadListDto> {
        self.check_network()?;
        self.read_lists
            .lock()
            .unwrap()
            .get(read_list_id)
            .cloned()
            .ok_or_else(|| Self::not_found(read_list_id))
    }

    async fn read_list_books_page(
        &self,
        read_list_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>> {
        self.check_network()?;
        let member_ids = self
            .read_lists
            .lock()
            .unwrap()
            .get(read_list_id)
            .map(|r| r.book_ids.clone())
            .ok_or_else(|| Self::not_found(read_list_id))?;
        let books = self.books.lock().unwrap();
        let members: Vec<BookDto> = member_ids
            .iter()
            .filter_map(|id| books.get(id).cloned())
            .collect();
        Ok(Self::paginate(members, page, size))
    }

    async fn book_pages(&self, book_id: &str) -> Result<Vec<BookPage>> {
        self.check_network()?;
        self.pages
            .lock()
            .unwrap()
            .get(book_id)
            .cloned()
            .ok_or_else(|| Self::not_found(book_id))
    }

    async fn book_page(&self, book_id: &str, number: i64) -> Result<Bytes> {
        self.check_network()?;
        // 每页固定内容，长度与页号相关，便于校验落盘大小
        Ok(Bytes::from(vec![0xABu8; (number as usize + 1) * 16]))
    }

    async fn book_file(&self, _book_id: &str) -> Result<Bytes> {
        self.check_network()?;
        Ok(Bytes::from_static(b"PK epub payload"))
    }

    async fn update_read_progress(&self, book_id: &str, page: i64, completed: bool) -> Result<()> {
        self.check_network()?;
        if self.fail_progress.load(Ordering::SeqCst) {
            return Err(KMReaderError::from_status(
                500,
                format!("http://mock/books/{}/read-progress", book_id),
                "boom",
            ));
        }
        self.progress_calls
            .lock()
            .unwrap()
            .push((book_id.to_string(), page, completed));
        // 服务端确认后，后续的单书同步会带回这份进度
        if let Some(book) = self.books.lock().unwrap().get_mut(book_id) {
            book.read_progress = Some(ReadProgressDto {
                page,
                completed,
                read_date: Some(Utc::now()),
                created: Some(Utc::now()),
                last_modified: Some(Utc::now()),
            });
        }
        Ok(())
    }
}

// ---- 实体构造器 ----

pub fn series_dto(id: &str, name: &str, books_count: i64) -> SeriesDto {
    SeriesDto {
        id: id.to_string(),
        library_id: "lib-1".to_string(),
        name: name.to_string(),
        books_count,
        books_read_count: 0,
        books_unread_count: books_count,
        books_in_progress_count: 0,
        metadata: SeriesMetadataDto {
            title: name.to_string(),
            title_sort: name.to_string(),
            ..Default::default()
        },
        created: Utc.timestamp_millis_opt(1_000).unwrap(),
        last_modified: Utc.timestamp_millis_opt(2_000).unwrap(),
        deleted: false,
        oneshot: false,
    }
}

pub fn book_dto(id: &str, series_id: &str, number: f64) -> BookDto {
    BookDto {
        id: id.to_string(),
        series_id: series_id.to_string(),
        library_id: "lib-1".to_string(),
        name: format!("Book {}", id),
        size_bytes: 2048,
        media: MediaDto {
            pages_count: 3,
            media_profile: "DIVINA".to_string(),
        },
        metadata: BookMetadataDto {
            title: format!("Book {}", id),
            number: format!("{}", number),
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

pub fn book_pages(count: i64) -> Vec<BookPage> {
    (1..=count)
        .map(|number| BookPage {
            number,
            file_name: format!("{:03}.jpg", number),
            media_type: "image/jpeg".to_string(),
            width: None,
            height: None,
        })
        .collect()
}

/// 轮询等待条件成立（小步长，上限 3 秒）
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..150 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}
