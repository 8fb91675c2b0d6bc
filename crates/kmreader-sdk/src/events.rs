//! 事件系统 - 本地镜像变更的发布/订阅
//!
//! 同步引擎、离线下载管理器在写入本地镜像后通过 EventBus 广播变更；
//! UI 层订阅后按需刷新。不依赖任何特定的响应式框架，
//! 底层为 tokio broadcast channel。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// 事件缓冲区大小：突发 SSE 事件会被 UI 端去抖合并，缓冲足够即可
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 本地镜像变更事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreEvent {
    /// 实例的库列表已替换
    LibrariesChanged { instance_id: String },
    /// 某个系列被插入或更新
    SeriesChanged {
        instance_id: String,
        series_id: String,
    },
    /// 某个系列被删除
    SeriesDeleted {
        instance_id: String,
        series_id: String,
    },
    BookChanged {
        instance_id: String,
        book_id: String,
        series_id: String,
    },
    BookDeleted {
        instance_id: String,
        book_id: String,
    },
    CollectionChanged {
        instance_id: String,
        collection_id: String,
    },
    CollectionDeleted {
        instance_id: String,
        collection_id: String,
    },
    ReadListChanged {
        instance_id: String,
        read_list_id: String,
    },
    ReadListDeleted {
        instance_id: String,
        read_list_id: String,
    },
    /// 阅读进度变更（本地写入或服务端推送触发的重新同步）
    ReadProgressChanged {
        instance_id: String,
        book_id: String,
    },
    /// 某本书的下载状态变化（含进度更新）
    DownloadStatusChanged {
        instance_id: String,
        book_id: String,
    },
    /// 系列聚合下载状态被重新计算
    SeriesDownloadStatusChanged {
        instance_id: String,
        series_id: String,
    },
    /// 缩略图变更（按实体粒度，UI 据此丢弃图片缓存）
    ThumbnailChanged {
        instance_id: String,
        entity_id: String,
    },
    /// 服务端任务队列状态
    TaskQueueStatus { count: i64 },
    /// 会话过期，需要重新登录
    SessionExpired { instance_id: String },
}

/// 事件总线：clone 共享，publish 永不阻塞
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// 订阅变更事件
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// 广播事件；没有订阅者时静默丢弃
    pub fn publish(&self, event: StoreEvent) {
        debug!("📣 publish event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
