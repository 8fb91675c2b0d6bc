//! SSE 事件分发 - 按事件类型触发定向单实体重同步
//!
//! 原则：收到推送永远只刷新受影响的那一个实体，绝不触发全量同步。
//! 重同步彼此独立，完成顺序可以乱序（每个都是幂等 upsert）。
//! 事件风暴的合并由 UI 层去抖处理，这里只负责立即派发。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{EventBus, StoreEvent};
use crate::gateway::sse::SseEvent;
use crate::offline::OfflineManager;
use crate::storage::MirrorStore;
use crate::sync::engine::SyncEngine;

/// SSE 事件分发器
pub struct SseDispatcher {
    engine: Arc<SyncEngine>,
    store: MirrorStore,
    offline: Arc<OfflineManager>,
    events: EventBus,
}

impl SseDispatcher {
    pub fn new(
        engine: Arc<SyncEngine>,
        store: MirrorStore,
        offline: Arc<OfflineManager>,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            store,
            offline,
            events,
        }
    }

    /// 处理一条推送事件；重同步失败只记日志（下一条事件或下一次
    /// 分页加载会再次覆盖到同一实体）。
    pub async fn handle_event(&self, instance_id: &str, event: SseEvent) {
        debug!("📡 SSE 事件: {:?}", event);
        match event {
            SseEvent::SeriesAdded(dto) | SseEvent::SeriesChanged(dto) => {
                if let Err(e) = self
                    .engine
                    .sync_series_detail(instance_id, &dto.series_id)
                    .await
                {
                    warn!("系列重同步失败 {}: {}", dto.series_id, e);
                }
            }
            SseEvent::SeriesDeleted(dto) => {
                let _ = self.store.delete_series(instance_id, &dto.series_id).await;
                self.events.publish(StoreEvent::SeriesDeleted {
                    instance_id: instance_id.to_string(),
                    series_id: dto.series_id,
                });
            }
            SseEvent::BookAdded(dto) => {
                if let Err(e) = self.engine.sync_book(instance_id, &dto.book_id).await {
                    warn!("书目重同步失败 {}: {}", dto.book_id, e);
                    return;
                }
                // 新书是自动下载策略的触发点
                match self
                    .store
                    .sync_series_download_status(instance_id, &dto.series_id)
                    .await
                {
                    Ok(outcome) => {
                        self.offline
                            .apply_policy_outcome(instance_id, &outcome)
                            .await;
                        self.events.publish(StoreEvent::SeriesDownloadStatusChanged {
                            instance_id: instance_id.to_string(),
                            series_id: dto.series_id,
                        });
                    }
                    Err(e) => warn!("聚合状态重算失败 {}: {}", dto.series_id, e),
                }
            }
            SseEvent::BookChanged(dto) => {
                if let Err(e) = self.engine.sync_book(instance_id, &dto.book_id).await {
                    warn!("书目重同步失败 {}: {}", dto.book_id, e);
                }
            }
            SseEvent::BookDeleted(dto) => {
                let _ = self.store.delete_book(instance_id, &dto.book_id).await;
                // 服务端删了书，本地离线副本也没有意义了
                self.offline.delete_book(instance_id, &dto.book_id).await;
                self.events.publish(StoreEvent::BookDeleted {
                    instance_id: instance_id.to_string(),
                    book_id: dto.book_id,
                });
            }
            SseEvent::BookImported(dto) => {
                if let Some(book_id) = dto.book_id {
                    if dto.success {
                        let _ = self.engine.sync_book(instance_id, &book_id).await;
                    }
                }
            }
            SseEvent::CollectionAdded(dto) | SseEvent::CollectionChanged(dto) => {
                if let Err(e) = self
                    .engine
                    .sync_collection(instance_id, &dto.collection_id)
                    .await
                {
                    warn!("合集重同步失败 {}: {}", dto.collection_id, e);
                }
            }
            SseEvent::CollectionDeleted(dto) => {
                let _ = self
                    .store
                    .delete_collection(instance_id, &dto.collection_id)
                    .await;
                self.events.publish(StoreEvent::CollectionDeleted {
                    instance_id: instance_id.to_string(),
                    collection_id: dto.collection_id,
                });
            }
            SseEvent::ReadListAdded(dto) | SseEvent::ReadListChanged(dto) => {
                if let Err(e) = self
                    .engine
                    .sync_read_list(instance_id, &dto.read_list_id)
                    .await
                {
                    warn!("阅读列表重同步失败 {}: {}", dto.read_list_id, e);
                }
            }
            SseEvent::ReadListDeleted(dto) => {
                let _ = self
                    .store
                    .delete_read_list(instance_id, &dto.read_list_id)
                    .await;
                self.events.publish(StoreEvent::ReadListDeleted {
                    instance_id: instance_id.to_string(),
                    read_list_id: dto.read_list_id,
                });
            }
            SseEvent::ReadProgressChanged(dto) | SseEvent::ReadProgressDeleted(dto) => {
                if self.engine.sync_book(instance_id, &dto.book_id).await.is_ok() {
                    self.events.publish(StoreEvent::ReadProgressChanged {
                        instance_id: instance_id.to_string(),
                        book_id: dto.book_id,
                    });
                }
            }
            SseEvent::ReadProgressSeriesChanged(dto)
            | SseEvent::ReadProgressSeriesDeleted(dto) => {
                let _ = self
                    .engine
                    .sync_series_detail(instance_id, &dto.series_id)
                    .await;
            }
            SseEvent::ThumbnailBookAdded(dto) | SseEvent::ThumbnailBookDeleted(dto) => {
                self.events.publish(StoreEvent::ThumbnailChanged {
                    instance_id: instance_id.to_string(),
                    entity_id: dto.book_id,
                });
            }
            SseEvent::ThumbnailSeriesAdded(dto) | SseEvent::ThumbnailSeriesDeleted(dto) => {
                self.events.publish(StoreEvent::ThumbnailChanged {
                    instance_id: instance_id.to_string(),
                    entity_id: dto.series_id,
                });
            }
            SseEvent::ThumbnailCollectionAdded(dto)
            | SseEvent::ThumbnailCollectionDeleted(dto) => {
                self.events.publish(StoreEvent::ThumbnailChanged {
                    instance_id: instance_id.to_string(),
                    entity_id: dto.collection_id,
                });
            }
            SseEvent::ThumbnailReadListAdded(dto) | SseEvent::ThumbnailReadListDeleted(dto) => {
                self.events.publish(StoreEvent::ThumbnailChanged {
                    instance_id: instance_id.to_string(),
                    entity_id: dto.read_list_id,
                });
            }
            SseEvent::TaskQueueStatus(dto) => {
                self.events
                    .publish(StoreEvent::TaskQueueStatus { count: dto.count });
            }
            SseEvent::SessionExpired(_) => {
                self.events.publish(StoreEvent::SessionExpired {
                    instance_id: instance_id.to_string(),
                });
            }
        }
    }
}
