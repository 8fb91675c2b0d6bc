//! 页面缓存 - 有上限的磁盘图像缓存与 LRU 清理
//!
//! 目录布局：<root>/page-cache/<instance>/<book>/<page>/<file>
//! 配额按高低水位执行：超过配额 90% 触发清理，按修改时间从旧到新
//! 删除，降到 80% 为止。按书清空是用户动作，完全绕过配额逻辑。

pub mod accounting;

pub use accounting::{CacheAccounting, CacheStats};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, error, warn};

use crate::storage::entities::BookPage;

const CLEANUP_HIGH_WATERMARK_PERCENT: i64 = 90;
const CLEANUP_TARGET_PERCENT: i64 = 80;
const CLEANUP_THROTTLE: Duration = Duration::from_secs(5);

/// 磁盘页面缓存
#[derive(Debug)]
pub struct PageCache {
    root: PathBuf,
    accounting: CacheAccounting,
    max_bytes: AtomicI64,
}

/// 扫描出的一个缓存文件
struct FileInfo {
    path: PathBuf,
    size: i64,
    modified: Option<SystemTime>,
}

impl PageCache {
    pub fn new(data_dir: &Path, max_mb: u64) -> Self {
        Self {
            root: data_dir.join("page-cache"),
            accounting: CacheAccounting::new(),
            max_bytes: AtomicI64::new((max_mb as i64) * 1024 * 1024),
        }
    }

    /// 调整配额；收紧时立即触发一轮清理
    pub fn set_max_size_mb(self: &Arc<Self>, max_mb: u64) {
        self.max_bytes
            .store((max_mb as i64) * 1024 * 1024, Ordering::Relaxed);
        let cache = self.clone();
        tokio::spawn(async move {
            cache.cleanup_if_needed().await;
        });
    }

    pub fn max_bytes(&self) -> i64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    fn book_dir(&self, instance_id: &str, book_id: &str) -> PathBuf {
        self.root.join(instance_id).join(book_id)
    }

    /// 缓存文件路径（不创建目录，文件不一定存在）
    pub fn page_path(&self, instance_id: &str, book_id: &str, page: &BookPage) -> PathBuf {
        // 文件名只取最后一段，空名退回 page-N
        let sanitized = Path::new(&page.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("page-{}", page.number));
        self.book_dir(instance_id, book_id)
            .join(page.number.to_string())
            .join(sanitized)
    }

    pub fn has_page(&self, instance_id: &str, book_id: &str, page: &BookPage) -> bool {
        self.page_path(instance_id, book_id, page).exists()
    }

    /// 写入一页缓存数据并维护记账；写失败只记日志，不动记账
    pub async fn store_page(
        self: &Arc<Self>,
        instance_id: &str,
        book_id: &str,
        page: &BookPage,
        data: &[u8],
    ) {
        if book_id.is_empty() {
            return;
        }
        let path = self.page_path(instance_id, book_id, page);
        let old_size = fs::metadata(&path).await.ok().map(|m| m.len() as i64);
        let new_size = data.len() as i64;

        // 写之前看水位，必要时先起一轮清理
        let (size, _, valid) = self.accounting.get().await;
        let high = self.high_watermark();
        if !valid {
            self.spawn_cleanup();
        } else if let Some(size) = size {
            if size - old_size.unwrap_or(0) + new_size > high {
                self.spawn_cleanup();
            }
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!("创建缓存目录失败: {}", e);
                return;
            }
        }
        let existed = old_size.is_some();
        if let Err(e) = fs::write(&path, data).await {
            error!(
                "❌ 写入页面缓存失败 book={} page={}: {}",
                book_id, page.number, e
            );
            return;
        }

        self.accounting
            .update_size(new_size - old_size.unwrap_or(0))
            .await;
        if !existed {
            self.accounting.update_count(1).await;
        }

        // 写入后再查一次，超水位立即清理
        let (size_after, _, valid_after) = self.accounting.get().await;
        if valid_after {
            if let Some(size) = size_after {
                if size > high {
                    self.spawn_cleanup();
                }
            }
        }
    }

    /// 把缓存页拷到目标路径（离线下载复用缓存，避免重复拉取）
    pub async fn copy_page_to(
        &self,
        instance_id: &str,
        book_id: &str,
        page: &BookPage,
        destination: &Path,
    ) -> bool {
        let source = self.page_path(instance_id, book_id, page);
        if !source.exists() {
            return false;
        }
        match fs::copy(&source, destination).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "复制缓存页失败 book={} page={}: {}",
                    book_id, page.number, e
                );
                false
            }
        }
    }

    /// 按书清空缓存：用户动作，绕过配额逻辑，记账直接失效
    pub async fn clear_book(&self, instance_id: &str, book_id: &str) {
        let dir = self.book_dir(instance_id, book_id);
        let _ = fs::remove_dir_all(&dir).await;
        self.accounting.invalidate().await;
    }

    /// 清空一个实例的全部缓存
    pub async fn clear_instance(&self, instance_id: &str) {
        let dir = self.root.join(instance_id);
        let _ = fs::remove_dir_all(&dir).await;
        let _ = fs::create_dir_all(&dir).await;
        self.accounting.invalidate().await;
    }

    /// 清空全部缓存并把记账归零
    pub async fn clear_all(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(&self.root).await;
        self.accounting.set(0, 0).await;
    }

    /// 缓存统计；invalid 时全量重扫后返回
    pub async fn stats(&self) -> CacheStats {
        let (size, count, valid) = self.accounting.get().await;
        if valid {
            return CacheStats {
                size: size.unwrap_or(0),
                count: count.unwrap_or(0),
                valid: true,
            };
        }

        let files = self.collect_files().await;
        let total: i64 = files.iter().map(|f| f.size).sum();
        let count = files.len() as i64;
        self.accounting.set(total, count).await;
        CacheStats {
            size: total,
            count,
            valid: true,
        }
    }

    fn high_watermark(&self) -> i64 {
        self.max_bytes() * CLEANUP_HIGH_WATERMARK_PERCENT / 100
    }

    fn target_size(&self) -> i64 {
        self.max_bytes() * CLEANUP_TARGET_PERCENT / 100
    }

    fn spawn_cleanup(self: &Arc<Self>) {
        let cache = self.clone();
        tokio::spawn(async move {
            cache.cleanup_if_needed().await;
        });
    }

    /// 超水位（或记账失效）时执行 LRU 清理
    pub async fn cleanup_if_needed(&self) {
        let high = self.high_watermark();
        let (size, _, valid) = self.accounting.get().await;
        if valid {
            if let Some(size) = size {
                if size <= high {
                    return;
                }
            }
        }

        if !self
            .accounting
            .try_begin_cleanup(CLEANUP_THROTTLE, !valid)
            .await
        {
            return;
        }

        self.perform_cleanup(valid).await;
        self.accounting.end_cleanup().await;
    }

    async fn perform_cleanup(&self, was_valid: bool) {
        let high = self.high_watermark();
        let target = self.target_size();

        let mut files = self.collect_files().await;
        let total: i64 = files.iter().map(|f| f.size).sum();
        let file_count = files.len() as i64;

        if total > high {
            debug!(
                "🧹 缓存清理开始: total={}B high={}B target={}B files={}",
                total, high, target, file_count
            );
            // 修改时间从旧到新，删到 target 以下
            files.sort_by_key(|f| f.modified.unwrap_or(SystemTime::UNIX_EPOCH));
            let mut current = total;
            let mut bytes_deleted: i64 = 0;
            let mut files_deleted: i64 = 0;

            for file in &files {
                if current <= target {
                    break;
                }
                match fs::remove_file(&file.path).await {
                    Ok(()) => {
                        bytes_deleted += file.size;
                        files_deleted += 1;
                        current -= file.size;
                    }
                    Err(_) => {
                        // 删除失败（并发删除或权限）：不计入删除量
                    }
                }
            }

            if was_valid {
                self.accounting.update_size(-bytes_deleted).await;
                self.accounting.update_count(-files_deleted).await;
            } else {
                // invalid 状态下必须写绝对值：扫描值减去我们删掉的部分
                self.accounting
                    .set(total - bytes_deleted, file_count - files_deleted)
                    .await;
            }
            debug!(
                "🧹 缓存清理完成: deleted={} freed={}B remaining={}B",
                files_deleted,
                bytes_deleted,
                (total - bytes_deleted).max(0)
            );
        } else if !was_valid {
            // 扫描结果在水位内：invalid 时落盘绝对值；valid 时什么都不做，
            // 避免覆盖清理期间并发写入的增量
            self.accounting.set(total, file_count).await;
        }
    }

    async fn collect_files(&self) -> Vec<FileInfo> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            if !root.exists() {
                return files;
            }
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                files.push(FileInfo {
                    path: entry.into_path(),
                    size: meta.len() as i64,
                    modified: meta.modified().ok(),
                });
            }
            files
        })
        .await
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn page(number: i64) -> BookPage {
        BookPage {
            number,
            file_name: format!("{:03}.jpg", number),
            media_type: "image/jpeg".to_string(),
            width: None,
            height: None,
        }
    }

    fn mb(n: usize) -> Vec<u8> {
        vec![0u8; n * 1024 * 1024]
    }

    #[tokio::test]
    async fn store_and_stats_track_real_sizes() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(PageCache::new(dir.path(), 100));

        cache.store_page("inst", "b1", &page(1), &[1, 2, 3]).await;
        cache.store_page("inst", "b1", &page(2), &[4, 5, 6, 7]).await;

        let stats = cache.stats().await;
        assert!(stats.valid);
        assert_eq!(stats.size, 7);
        assert_eq!(stats.count, 2);

        // 覆盖写同一页只更新体积差
        cache.store_page("inst", "b1", &page(1), &[9]).await;
        let stats = cache.stats().await;
        assert_eq!(stats.size, 5);
        assert_eq!(stats.count, 2);
    }

    #[tokio::test]
    async fn clear_book_invalidates_then_rescan_recovers() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(PageCache::new(dir.path(), 100));

        cache.store_page("inst", "b1", &page(1), &[1, 2, 3]).await;
        cache.store_page("inst", "b2", &page(1), &[1, 2, 3, 4]).await;

        cache.clear_book("inst", "b1").await;
        assert!(!cache.has_page("inst", "b1", &page(1)));
        assert!(cache.has_page("inst", "b2", &page(1)));

        // 失效后 stats 触发重扫，结果等于剩余文件的真实大小
        let stats = cache.stats().await;
        assert_eq!(stats.size, 4);
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn eviction_removes_oldest_until_under_target() {
        let dir = TempDir::new().unwrap();
        // 先用宽松配额写入，避免写入过程中触发并发清理
        let writer = Arc::new(PageCache::new(dir.path(), 1000));
        for i in 0..6 {
            writer.store_page("inst", "b1", &page(i), &mb(2)).await;
            // 拉开修改时间，保证 LRU 顺序稳定
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        // 配额 10MB：高水位 9MB，目标 8MB；新实例记账失效，清理走全量重扫
        let cache = Arc::new(PageCache::new(dir.path(), 10));
        cache.cleanup_if_needed().await;

        let stats = cache.stats().await;
        assert!(stats.size <= 8 * 1024 * 1024, "size={} 未降到目标", stats.size);

        // 记账值等于磁盘上剩余文件的真实大小之和
        let mut remaining = 0i64;
        for i in 0..6 {
            let path = cache.page_path("inst", "b1", &page(i));
            if let Ok(meta) = std::fs::metadata(&path) {
                remaining += meta.len() as i64;
            }
        }
        assert_eq!(stats.size, remaining);

        // 最旧的页先被清掉，最新的还在
        assert!(!cache.has_page("inst", "b1", &page(0)));
        assert!(cache.has_page("inst", "b1", &page(5)));
    }

    #[tokio::test]
    async fn copy_page_reuses_cached_data() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(PageCache::new(dir.path(), 100));
        cache.store_page("inst", "b1", &page(1), &[7, 8, 9]).await;

        let dest_dir = TempDir::new().unwrap();
        let dest = dest_dir.path().join("page-1.jpg");
        assert!(cache.copy_page_to("inst", "b1", &page(1), &dest).await);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7, 8, 9]);

        let missing = dest_dir.path().join("page-2.jpg");
        assert!(!cache.copy_page_to("inst", "b1", &page(2), &missing).await);
    }

    #[tokio::test]
    async fn clear_all_resets_accounting_to_zero() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(PageCache::new(dir.path(), 100));
        cache.store_page("inst", "b1", &page(1), &[1, 2, 3]).await;

        cache.clear_all().await;
        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.count, 0);
        assert!(stats.valid);
    }
}
