//! 数据访问层 (DAO) - 每张表一个专门的操作模块
//!
//! 这里封装了所有数据库操作，确保：
//! - upsert 按复合主键整体覆盖服务端字段，本地状态列不被触碰
//! - 排序 / 过滤语义集中在一处（pinned 优先、随机排序等）
//! - 读接口保持调用方给定的 id 顺序

pub mod book;
pub mod collection;
pub mod library;
pub mod pending_progress;
pub mod read_list;
pub mod series;

pub use book::BookDao;
pub use collection::CollectionDao;
pub use library::LibraryDao;
pub use pending_progress::PendingProgressDao;
pub use read_list::ReadListDao;
pub use series::SeriesDao;

use chrono::{DateTime, TimeZone, Utc};

/// 可排序字段（镜像侧支持的固定集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    TitleSort,
    Name,
    Created,
    LastModified,
    DownloadAt,
    BooksCount,
    Random,
}

/// 排序说明：`field,direction` 字符串或字面量 `random`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub ascending: bool,
}

impl Sort {
    pub fn new(field: SortField, ascending: bool) -> Self {
        Self { field, ascending }
    }

    /// 解析服务端风格的排序串；无法识别时退回标题排序
    pub fn parse(raw: &str) -> Self {
        if raw == "random" {
            return Self::new(SortField::Random, true);
        }
        let mut parts = raw.split(',');
        let field_raw = parts.next().unwrap_or_default();
        let ascending = parts.next().map(|d| d != "desc").unwrap_or(true);

        let field = if field_raw.contains("titleSort") {
            SortField::TitleSort
        } else if field_raw.contains("downloadAt") {
            SortField::DownloadAt
        } else if field_raw.contains("lastModified") {
            SortField::LastModified
        } else if field_raw.contains("created") {
            SortField::Created
        } else if field_raw.contains("booksCount") {
            SortField::BooksCount
        } else if field_raw.contains("name") {
            SortField::Name
        } else {
            SortField::TitleSort
        };
        Self::new(field, ascending)
    }

    /// 系列表的 ORDER BY 子句
    pub(crate) fn series_order_clause(&self) -> String {
        let dir = if self.ascending { "ASC" } else { "DESC" };
        match self.field {
            SortField::TitleSort => format!("meta_title_sort COLLATE NOCASE {}", dir),
            SortField::Name => format!("name COLLATE NOCASE {}", dir),
            SortField::Created => format!("created {}", dir),
            SortField::LastModified => format!("last_modified {}", dir),
            // 没有下载记录的排在后面
            SortField::DownloadAt => format!("download_at IS NULL, download_at {}", dir),
            SortField::BooksCount => format!("books_count {}", dir),
            SortField::Random => "RANDOM()".to_string(),
        }
    }
}

impl Default for Sort {
    fn default() -> Self {
        Self::new(SortField::TitleSort, true)
    }
}

/// 系列查询过滤
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub library_ids: Vec<String>,
    pub search: Option<String>,
    /// 只看有离线内容（已下载或排队中）的系列
    pub offline_only: bool,
}

// ---- 行辅助：时间戳与 JSON 列 ----

pub(crate) fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn opt_millis(dt: &Option<DateTime<Utc>>) -> Option<i64> {
    dt.as_ref().map(to_millis)
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

pub(crate) fn from_opt_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// JSON TEXT 列 → 值；坏数据按空值处理而不是让整行查询失败
pub(crate) fn decode_json<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

/// 按输入 id 顺序重排查询结果（查询本身不保证顺序）
pub(crate) fn order_by_ids<T, F>(mut rows: Vec<T>, ids: &[String], key: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    use std::collections::HashMap;
    let index: HashMap<&str, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    rows.sort_by_key(|row| index.get(key(row)).copied().unwrap_or(usize::MAX));
    rows
}
