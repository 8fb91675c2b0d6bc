//! 远端网关 - 同步引擎消费的 Komga HTTP/SSE 客户端抽象
//!
//! 同步引擎只依赖这里的 `Gateway` trait；真实实现见 `http::HttpGateway`，
//! 测试里用内存 mock 替换。DTO 与 Komga REST API 的 JSON 形状一一对应。

pub mod http;
pub mod sse;

pub use http::HttpGateway;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::entities::BookPage;

/// 服务端分页响应：content + last 标记
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub last: bool,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, last: bool) -> Self {
        Self { content, last }
    }
}

/// 系列分页查询参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesPageQuery {
    pub library_ids: Vec<String>,
    pub page: usize,
    pub size: usize,
    /// `field,direction` 形式，或字面量 `random`
    pub sort: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDto {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeriesMetadataDto {
    pub title: String,
    pub title_lock: bool,
    pub title_sort: String,
    pub title_sort_lock: bool,
    pub status: String,
    pub status_lock: bool,
    pub summary: String,
    pub summary_lock: bool,
    pub publisher: String,
    pub publisher_lock: bool,
    pub language: String,
    pub language_lock: bool,
    pub age_rating: Option<i64>,
    pub age_rating_lock: bool,
    pub total_book_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesDto {
    pub id: String,
    pub library_id: String,
    pub name: String,
    #[serde(default)]
    pub books_count: i64,
    #[serde(default)]
    pub books_read_count: i64,
    #[serde(default)]
    pub books_unread_count: i64,
    #[serde(default)]
    pub books_in_progress_count: i64,
    #[serde(default)]
    pub metadata: SeriesMetadataDto,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub oneshot: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorDto {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebLinkDto {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BookMetadataDto {
    pub title: String,
    pub title_lock: bool,
    pub number: String,
    pub number_lock: bool,
    pub number_sort: f64,
    pub number_sort_lock: bool,
    pub summary: String,
    pub summary_lock: bool,
    pub release_date: Option<String>,
    pub release_date_lock: bool,
    pub isbn: String,
    pub isbn_lock: bool,
    pub authors: Vec<AuthorDto>,
    pub authors_lock: bool,
    pub tags: Vec<String>,
    pub tags_lock: bool,
    pub links: Vec<WebLinkDto>,
    pub links_lock: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaDto {
    pub pages_count: i64,
    pub media_profile: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadProgressDto {
    pub page: i64,
    pub completed: bool,
    pub read_date: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDto {
    pub id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub media: MediaDto,
    #[serde(default)]
    pub metadata: BookMetadataDto,
    #[serde(default)]
    pub read_progress: Option<ReadProgressDto>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub oneshot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDto {
    pub id: String,
    pub name: String,
    pub ordered: bool,
    #[serde(default)]
    pub series_ids: Vec<String>,
    #[serde(default)]
    pub filtered: bool,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadListDto {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub ordered: bool,
    #[serde(default)]
    pub book_ids: Vec<String>,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

/// 同步引擎依赖的远端契约
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn libraries(&self) -> Result<Vec<LibraryDto>>;

    async fn series_page(&self, query: &SeriesPageQuery) -> Result<Page<SeriesDto>>;
    /// 按 created 倒序的新增系列
    async fn new_series_page(
        &self,
        library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>>;
    /// 按 lastModified 倒序的最近更新系列
    async fn updated_series_page(
        &self,
        library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>>;
    async fn series(&self, series_id: &str) -> Result<SeriesDto>;
    async fn series_books_page(
        &self,
        series_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>>;
    async fn book(&self, book_id: &str) -> Result<BookDto>;

    async fn collections_page(
        &self,
        page: usize,
        size: usize,
        search: Option<&str>,
    ) -> Result<Page<CollectionDto>>;
    async fn collection(&self, collection_id: &str) -> Result<CollectionDto>;
    async fn collection_series_page(
        &self,
        collection_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>>;

    async fn read_lists_page(
        &self,
        page: usize,
        size: usize,
        search: Option<&str>,
    ) -> Result<Page<ReadListDto>>;
    async fn read_list(&self, read_list_id: &str) -> Result<ReadListDto>;
    async fn read_list_books_page(
        &self,
        read_list_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>>;

    /// 一本书的页面元数据
    async fn book_pages(&self, book_id: &str) -> Result<Vec<BookPage>>;
    /// 单页原始图像数据
    async fn book_page(&self, book_id: &str, number: i64) -> Result<Bytes>;
    /// 整本书的原始文件（EPUB 等单文件格式）
    async fn book_file(&self, book_id: &str) -> Result<Bytes>;

    /// 上报阅读进度；返回 Ok 即视为服务端已确认
    async fn update_read_progress(&self, book_id: &str, page: i64, completed: bool) -> Result<()>;
}
