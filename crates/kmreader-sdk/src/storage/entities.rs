//! 数据实体定义 - 本地镜像的类型安全数据传输
//!
//! 所有镜像实体共享同一形状：
//! - `id` 为复合主键（{instance_id}_{remote_id}），一个库多实例复用
//! - 服务端权威字段在每次同步时整体覆盖（last-writer-wins）
//! - 本地状态字段（离线策略、下载状态、置顶）只由本地写入，同步不触碰

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 系列离线策略：控制新书同步 / 阅读完成时的自动下载与清理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesOfflinePolicy {
    /// 不做任何自动行为，只响应手动开关
    Manual,
    /// 未读的书自动下载
    UnreadOnly,
    /// 未读自动下载，读完的本地副本自动删除
    UnreadOnlyAndCleanupRead,
    /// 所有书自动下载
    All,
}

impl SeriesOfflinePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::UnreadOnly => "unreadOnly",
            Self::UnreadOnlyAndCleanupRead => "unreadOnlyAndCleanupRead",
            Self::All => "all",
        }
    }

    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "unreadOnly" => Self::UnreadOnly,
            "unreadOnlyAndCleanupRead" => Self::UnreadOnlyAndCleanupRead,
            "all" => Self::All,
            _ => Self::Manual,
        }
    }
}

/// 单本书的下载状态机
///
/// notDownloaded → pending → downloading(progress) → downloaded；
/// failed 只能从 pending/downloading 进入；任何非终态都可取消回 notDownloaded。
/// 持久化时 downloading 落盘为 pending，进程重启后自动恢复排队。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadStatus {
    NotDownloaded,
    Pending,
    Downloading(f32),
    Downloaded,
    Failed(String),
}

impl DownloadStatus {
    /// 持久化文本（downloading 不落盘）
    pub fn as_raw(&self) -> &'static str {
        match self {
            Self::NotDownloaded => "notDownloaded",
            Self::Pending | Self::Downloading(_) => "pending",
            Self::Downloaded => "downloaded",
            Self::Failed(_) => "failed",
        }
    }

    /// 失败信息单独一列存储
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(e) => Some(e.as_str()),
            _ => None,
        }
    }

    pub fn from_raw(raw: &str, error: Option<String>) -> Self {
        match raw {
            "pending" => Self::Pending,
            "downloaded" => Self::Downloaded,
            "failed" => Self::Failed(error.unwrap_or_default()),
            _ => Self::NotDownloaded,
        }
    }

    /// 状态机合法迁移检查
    pub fn can_transition_to(&self, target: &DownloadStatus) -> bool {
        match (self, target) {
            // 取消：任何非终态回 notDownloaded；删除：downloaded 也可回
            (_, DownloadStatus::NotDownloaded) => true,
            (DownloadStatus::NotDownloaded, DownloadStatus::Pending) => true,
            (DownloadStatus::Pending, DownloadStatus::Downloading(_)) => true,
            (DownloadStatus::Downloading(_), DownloadStatus::Downloading(_)) => true,
            (DownloadStatus::Downloading(_), DownloadStatus::Downloaded) => true,
            // 入队后元数据拉取失败等场景可以不经过 downloading 直接完成
            (DownloadStatus::Pending, DownloadStatus::Downloaded) => true,
            (DownloadStatus::Pending, DownloadStatus::Failed(_)) => true,
            (DownloadStatus::Downloading(_), DownloadStatus::Failed(_)) => true,
            (DownloadStatus::Failed(_), DownloadStatus::Pending) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Downloaded | Self::Failed(_))
    }
}

/// 系列（或阅读列表）的聚合下载状态，由成员书目状态推导，从不独立存储
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesDownloadStatus {
    NotDownloaded,
    Pending {
        downloaded: i64,
        pending: i64,
        total: i64,
    },
    PartiallyDownloaded {
        downloaded: i64,
        total: i64,
    },
    Downloaded,
}

impl SeriesDownloadStatus {
    /// 由成员计数推导聚合状态
    pub fn from_counts(downloaded: i64, pending: i64, total: i64) -> Self {
        if total > 0 && downloaded >= total {
            Self::Downloaded
        } else if pending > 0 {
            Self::Pending {
                downloaded,
                pending,
                total,
            }
        } else if downloaded > 0 {
            Self::PartiallyDownloaded { downloaded, total }
        } else {
            Self::NotDownloaded
        }
    }

    pub fn as_raw(&self) -> &'static str {
        match self {
            Self::NotDownloaded => "notDownloaded",
            Self::Pending { .. } => "pending",
            Self::PartiallyDownloaded { .. } => "partial",
            Self::Downloaded => "downloaded",
        }
    }
}

/// 系列元数据（服务端字段带锁标记，表示服务端已保护该字段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesMetadata {
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

/// 系列的本地状态（同步永不覆盖）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesLocalState {
    pub offline_policy: SeriesOfflinePolicy,
    pub download_status: SeriesDownloadStatus,
    pub downloaded_books: i64,
    pub pending_books: i64,
    pub downloaded_size: i64,
    pub download_at: Option<DateTime<Utc>>,
    pub pinned: bool,
}

impl Default for SeriesLocalState {
    fn default() -> Self {
        Self {
            offline_policy: SeriesOfflinePolicy::Manual,
            download_status: SeriesDownloadStatus::NotDownloaded,
            downloaded_books: 0,
            pending_books: 0,
            downloaded_size: 0,
            download_at: None,
            pinned: false,
        }
    }
}

/// 本地镜像中的系列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KomgaSeries {
    /// 复合主键
    pub id: String,
    pub instance_id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    pub metadata: SeriesMetadata,
    pub books_count: i64,
    pub books_read_count: i64,
    pub books_unread_count: i64,
    pub books_in_progress_count: i64,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub deleted: bool,
    pub oneshot: bool,
    /// 该系列所属 collection 的缓存 id 列表
    pub collection_ids: Vec<String>,
    pub local: SeriesLocalState,
}

/// 书目作者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub role: String,
}

/// 外部链接
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebLink {
    pub label: String,
    pub url: String,
}

/// 书目元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookMetadata {
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
    pub authors: Vec<Author>,
    pub authors_lock: bool,
    pub tags: Vec<String>,
    pub tags_lock: bool,
    pub links: Vec<WebLink>,
    pub links_lock: bool,
}

/// 阅读进度（每 (book, user) 一条，挂在书目记录上）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadProgress {
    /// 0 起的页号
    pub page: i64,
    pub completed: bool,
    pub read_date: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// 一页的元数据（下载与缓存寻址用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookPage {
    pub number: i64,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

/// 书目的本地下载状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDownloadState {
    pub status: DownloadStatus,
    pub downloaded_size: i64,
    pub download_at: Option<DateTime<Utc>>,
}

impl Default for BookDownloadState {
    fn default() -> Self {
        Self {
            status: DownloadStatus::NotDownloaded,
            downloaded_size: 0,
            download_at: None,
        }
    }
}

/// 本地镜像中的书目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KomgaBook {
    pub id: String,
    pub instance_id: String,
    pub book_id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    pub size_bytes: i64,
    pub page_count: i64,
    pub media_profile: String,
    pub metadata: BookMetadata,
    pub read_progress: Option<ReadProgress>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub deleted: bool,
    pub oneshot: bool,
    /// 该书所属 read list 的缓存 id 列表
    pub read_list_ids: Vec<String>,
    pub download: BookDownloadState,
    /// 离线下载时保存的页面元数据
    pub pages: Vec<BookPage>,
}

impl KomgaBook {
    pub fn is_read(&self) -> bool {
        self.read_progress
            .as_ref()
            .map(|p| p.completed)
            .unwrap_or(false)
    }
}

/// 系列合集（ordered=true 时成员列表顺序即权威顺序）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KomgaCollection {
    pub id: String,
    pub instance_id: String,
    pub collection_id: String,
    pub name: String,
    pub ordered: bool,
    pub series_ids: Vec<String>,
    pub filtered: bool,
    pub pinned: bool,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// 阅读列表；下载计数为派生物化视图，成员书目状态变化时重算
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KomgaReadList {
    pub id: String,
    pub instance_id: String,
    pub read_list_id: String,
    pub name: String,
    pub summary: String,
    pub ordered: bool,
    pub book_ids: Vec<String>,
    pub pinned: bool,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub downloaded_books: i64,
    pub pending_books: i64,
    pub downloaded_size: i64,
}

/// 库
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KomgaLibrary {
    pub id: String,
    pub instance_id: String,
    pub library_id: String,
    pub name: String,
}

/// 待回放的阅读进度（写前记录，服务端确认后删除）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProgress {
    /// 自增主键，回放按创建顺序进行
    pub id: i64,
    pub instance_id: String,
    pub book_id: String,
    pub page: i64,
    pub completed: bool,
    /// 可选的阅读器内部定位（流式排版格式使用），序列化后的 JSON
    pub position: Option<String>,
    pub created: DateTime<Utc>,
}
