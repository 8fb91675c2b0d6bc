//! 去抖执行器 - 合并突发触发为一次执行
//!
//! 新触发取消尚未执行的旧任务（取消-替换），restart 跳过等待立即执行。
//! 下载队列的踢动、SSE 突发后的刷新都经过它合并。

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// 调度一次执行；尚未开始的旧调度被取代。restart = 立即执行。
    pub fn call<F, Fut>(&self, restart: bool, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let delay = if restart { Duration::ZERO } else { self.delay };
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            f().await;
        });

        let mut pending = self.pending.lock();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(handle);
    }

    /// 取消未执行的调度
    pub fn cancel(&self) {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn burst_collapses_to_single_run() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            debouncer.call(false, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_fires_immediately() {
        let debouncer = Debouncer::new(Duration::from_secs(30));
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        debouncer.call(true, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_drops_pending_run() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        debouncer.call(false, move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
