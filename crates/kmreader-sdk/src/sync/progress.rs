//! 阅读进度同步 - 写前记录与重连回放
//!
//! 进度更新先落本地（书目行 + pending_progress 写前记录），在线时
//! 立刻尝试上报；离线或上报失败时记录保留，重连后按写入顺序回放，
//! 服务端确认后才删除记录。

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{EventBus, StoreEvent};
use crate::gateway::Gateway;
use crate::offline::RuntimeFlags;
use crate::storage::db_actor::PolicyOutcome;
use crate::storage::MirrorStore;
use crate::sync::engine::SyncEngine;

/// 回放结果统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub synced: usize,
    pub failed: usize,
}

/// 进度同步服务
pub struct ProgressSyncService {
    store: MirrorStore,
    gateway: Arc<dyn Gateway>,
    engine: Arc<SyncEngine>,
    events: EventBus,
    flags: Arc<RuntimeFlags>,
    /// 单飞：同一时刻只允许一轮回放
    replaying: Mutex<()>,
}

impl ProgressSyncService {
    pub fn new(
        store: MirrorStore,
        gateway: Arc<dyn Gateway>,
        engine: Arc<SyncEngine>,
        events: EventBus,
        flags: Arc<RuntimeFlags>,
    ) -> Self {
        Self {
            store,
            gateway,
            engine,
            events,
            flags,
            replaying: Mutex::new(()),
        }
    }

    /// 记录一次进度更新：先落本地，在线则立即上报。
    /// 返回策略评估结果（读完触发 cleanupRead 时由调用方落地）。
    pub async fn record_progress(
        &self,
        instance_id: &str,
        book_id: &str,
        page: i64,
        completed: bool,
        position: Option<String>,
    ) -> Result<PolicyOutcome> {
        let outcome = self
            .store
            .update_read_progress(instance_id, book_id, page, completed, position, true)
            .await?;
        self.events.publish(StoreEvent::ReadProgressChanged {
            instance_id: instance_id.to_string(),
            book_id: book_id.to_string(),
        });

        if !self.flags.is_offline() {
            // 在线：立即尝试回放（失败也无妨，记录还在）
            let report = self.sync_pending_progress(instance_id).await;
            debug!(
                "进度即时上报: synced={} failed={}",
                report.synced, report.failed
            );
        }
        Ok(outcome)
    }

    /// 回放待确认的进度记录，按写入顺序；服务端确认后删除记录，
    /// 之后重新同步读完的书与其系列，保持计数一致。
    pub async fn sync_pending_progress(&self, instance_id: &str) -> ReplayReport {
        let Ok(_guard) = self.replaying.try_lock() else {
            debug!("⏭️ 进度回放已在进行，跳过");
            return ReplayReport::default();
        };
        if self.flags.is_offline() {
            debug!("⏭️ 仍处于离线状态，跳过进度回放");
            return ReplayReport::default();
        }

        let pending = match self.store.fetch_pending_progress(instance_id).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("读取待回放进度失败: {}", e);
                return ReplayReport::default();
            }
        };
        if pending.is_empty() {
            return ReplayReport::default();
        }
        info!("🔄 回放 {} 条待确认进度", pending.len());

        let mut report = ReplayReport::default();
        let mut completed_book_ids = Vec::new();

        for item in pending {
            match self
                .gateway
                .update_read_progress(&item.book_id, item.page, item.completed)
                .await
            {
                Ok(()) => {
                    // 服务端已确认，删除写前记录
                    if let Err(e) = self.store.delete_pending_progress(item.id).await {
                        error!("删除待回放记录失败 id={}: {}", item.id, e);
                    }
                    report.synced += 1;
                    if item.completed {
                        completed_book_ids.push(item.book_id.clone());
                    }
                }
                Err(e) => {
                    error!("进度上报失败 book={}: {}", item.book_id, e);
                    report.failed += 1;
                }
            }
        }

        // 回放完成后刷新读完的书与所属系列
        let mut completed_series = std::collections::HashSet::new();
        for book_id in &completed_book_ids {
            if let Ok(book) = self.engine.sync_book(instance_id, book_id).await {
                completed_series.insert(book.series_id);
            }
        }
        for series_id in completed_series {
            let _ = self.engine.sync_series_detail(instance_id, &series_id).await;
        }

        if report.synced > 0 {
            info!("✅ 已回放 {} 条进度", report.synced);
        }
        if report.failed > 0 {
            warn!("⚠️ {} 条进度回放失败，下次重连再试", report.failed);
        }
        report
    }
}
