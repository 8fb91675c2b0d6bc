//! 缓存体积记账 - 唯一持有者串行化所有增量更新
//!
//! 大小/数量平时走增量（delta）维护；任何无法准确归因的变更
//! （外部删除、扫描失败）将状态标记为 invalid，之后的读取先触发
//! 全量重扫再恢复增量。清理入口带节流，避免重复扫描。

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// 对外暴露的缓存统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: i64,
    pub count: i64,
    pub valid: bool,
}

#[derive(Debug, Default)]
struct AccountState {
    /// None = invalid，需要全量重扫
    size: Option<i64>,
    count: Option<i64>,
    cleaning: bool,
    last_cleanup: Option<Instant>,
}

/// 记账状态的唯一持有者；所有变更都经过内部互斥锁串行化
#[derive(Debug, Default)]
pub struct CacheAccounting {
    state: Mutex<AccountState>,
}

impl CacheAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// (size, count, valid)
    pub async fn get(&self) -> (Option<i64>, Option<i64>, bool) {
        let state = self.state.lock().await;
        let valid = state.size.is_some() && state.count.is_some();
        (state.size, state.count, valid)
    }

    /// 全量重扫后写入绝对值
    pub async fn set(&self, size: i64, count: i64) {
        let mut state = self.state.lock().await;
        state.size = Some(size.max(0));
        state.count = Some(count.max(0));
    }

    /// 增量更新体积；invalid 状态下不做任何增量运算。体积永不为负。
    pub async fn update_size(&self, delta: i64) {
        let mut state = self.state.lock().await;
        if let Some(size) = state.size {
            state.size = Some((size + delta).max(0));
        }
    }

    /// 增量更新条目数；同样对 invalid 状态免疫，下限为 0
    pub async fn update_count(&self, delta: i64) {
        let mut state = self.state.lock().await;
        if let Some(count) = state.count {
            state.count = Some((count + delta).max(0));
        }
    }

    /// 无法归因的变更：标记 invalid，阻断后续增量直到重扫
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.size = None;
        state.count = None;
    }

    /// 申请进入清理流程；正在清理或距上次清理不足 min_interval 时拒绝。
    /// force（invalid 状态）绕过节流，但仍然互斥。
    pub async fn try_begin_cleanup(&self, min_interval: Duration, force: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.cleaning {
            return false;
        }
        if !force {
            if let Some(last) = state.last_cleanup {
                if last.elapsed() < min_interval {
                    return false;
                }
            }
        }
        state.cleaning = true;
        true
    }

    pub async fn end_cleanup(&self) {
        let mut state = self.state.lock().await;
        state.cleaning = false;
        state.last_cleanup = Some(Instant::now());
    }
}
