//! 离线下载模块
//!
//! - OfflineManager: 下载决策、队列与状态机执行
//! - DownloadProgressTracker: 传输中的内存进度

pub mod manager;
pub mod tracker;

pub use manager::OfflineManager;
pub use tracker::DownloadProgressTracker;

use std::sync::atomic::{AtomicBool, Ordering};

/// 运行期开关：离线模式与下载暂停（跨子系统共享）
#[derive(Debug, Default)]
pub struct RuntimeFlags {
    offline: AtomicBool,
    paused: AtomicBool,
}

impl RuntimeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }
}
