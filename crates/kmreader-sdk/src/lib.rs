//! KMReader SDK - Komga 兼容客户端的本地优先同步引擎
//!
//! 本 SDK 提供了漫画阅读客户端的数据核心，包括：
//! - 🔄 同步引擎：分页拉取 + 幂等 upsert，SSE 推送触发定向重同步
//! - 🗄️ 本地镜像：SQLite 单线程 Actor，按复合主键多实例共存
//! - ⬇️ 离线下载：按系列策略自动下载/清理，单传输队列与状态机
//! - 🧹 页面缓存：配额 + 高低水位 LRU 清理，体积记账串行化
//! - 📖 进度回放：离线写前记录，重连后按序回放，服务端确认后删除
//! - ⚙️ 事件系统：镜像变更的发布/订阅，不绑定任何 UI 框架
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use kmreader_sdk::{Credential, InstanceConfig, KMReaderConfig, KMReaderSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = KMReaderConfig::builder()
//!         .data_dir("/path/to/data")
//!         .max_page_cache_mb(1024)
//!         .build();
//!
//!     let sdk = KMReaderSDK::initialize(config).await?;
//!
//!     let instance = InstanceConfig::new(
//!         "Home",
//!         "https://komga.example.com",
//!         Credential::ApiKey("key".into()),
//!     );
//!     let instance_id = instance.instance_id.clone();
//!     sdk.register_instance(instance).await?;
//!
//!     sdk.login(&instance_id).await?;
//!     sdk.engine(&instance_id).await?.sync_all(&instance_id).await;
//!     sdk.connect_events(&instance_id).await?;
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod offline;
pub mod pagination;
pub mod sdk;
pub mod storage;
pub mod sync;

// 重新导出核心类型，方便使用
pub use cache::{CacheStats, PageCache};
pub use config::{Credential, InstanceConfig, KMReaderConfig, KMReaderConfigBuilder};
pub use error::{KMReaderError, Result};
pub use events::{EventBus, StoreEvent};
pub use gateway::{Gateway, HttpGateway, Page, SeriesPageQuery};
pub use identity::composite_id;
pub use offline::{DownloadProgressTracker, OfflineManager, RuntimeFlags};
pub use pagination::{LoadToken, PaginationState};
pub use sdk::KMReaderSDK;
pub use storage::entities::{
    DownloadStatus, KomgaBook, KomgaCollection, KomgaLibrary, KomgaReadList, KomgaSeries,
    SeriesDownloadStatus, SeriesOfflinePolicy,
};
pub use storage::{MirrorStore, PolicyOutcome, SeriesFilter, Sort, SortField};
pub use sync::{ProgressSyncService, ReplayReport, SseDispatcher, SyncEngine};
