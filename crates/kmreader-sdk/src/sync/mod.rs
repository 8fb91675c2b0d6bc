//! 同步模块
//!
//! - engine: 分页拉取 + 幂等 upsert
//! - progress: 阅读进度写前记录与重连回放
//! - dispatch: SSE 事件分发（定向单实体重同步）

pub mod dispatch;
pub mod engine;
pub mod progress;

pub use dispatch::SseDispatcher;
pub use engine::SyncEngine;
pub use progress::{ProgressSyncService, ReplayReport};
