//! 下载进度跟踪 - 传输中的内存进度（0..1）
//!
//! 进度不落盘：持久化状态只有 pending/downloaded/failed，
//! 传输中的百分比在这里维护并通过事件总线广播。

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::events::{EventBus, StoreEvent};

#[derive(Debug)]
pub struct DownloadProgressTracker {
    progress: RwLock<HashMap<String, f32>>,
    events: EventBus,
}

impl DownloadProgressTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            progress: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn update(&self, instance_id: &str, book_id: &str, value: f32) {
        self.progress
            .write()
            .insert(book_id.to_string(), value.clamp(0.0, 1.0));
        self.events.publish(StoreEvent::DownloadStatusChanged {
            instance_id: instance_id.to_string(),
            book_id: book_id.to_string(),
        });
    }

    pub fn get(&self, book_id: &str) -> Option<f32> {
        self.progress.read().get(book_id).copied()
    }

    pub fn clear(&self, book_id: &str) {
        self.progress.write().remove(book_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped_and_cleared() {
        let tracker = DownloadProgressTracker::new(EventBus::new());
        tracker.update("inst", "b1", 1.7);
        assert_eq!(tracker.get("b1"), Some(1.0));

        tracker.update("inst", "b1", 0.25);
        assert_eq!(tracker.get("b1"), Some(0.25));

        tracker.clear("b1");
        assert_eq!(tracker.get("b1"), None);
    }
}
