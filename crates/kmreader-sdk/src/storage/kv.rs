//! KV 存储模块 - 基于 sled 的设置与小状态存储
//!
//! 存放不适合进关系镜像的小键值：
//! - 全局设置（页面缓存配额、当前实例、离线/暂停开关）
//! - 每实例独立的 Tree（会话 token 等），实例间互不可见

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{KMReaderError, Result};

/// 全局设置键
pub mod settings_keys {
    /// 页面缓存配额（MB）
    pub const MAX_PAGE_CACHE_MB: &str = "max_page_cache_mb";
    /// 当前选中的实例 ID
    pub const CURRENT_INSTANCE: &str = "current_instance";
    /// 手动离线模式
    pub const OFFLINE_MODE: &str = "offline_mode";
    /// 暂停离线下载队列
    pub const DOWNLOADS_PAUSED: &str = "downloads_paused";
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 全局设置 Tree
    settings: Tree,
    /// 实例专属的 Tree
    instance_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| KMReaderError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（上一个进程可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            KMReaderError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let settings = db
            .open_tree("settings")
            .map_err(|e| KMReaderError::KvStore(format!("打开 settings Tree 失败: {}", e)))?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            settings,
            instance_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 读取全局设置
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Self::tree_get(&self.settings, key)
    }

    /// 写入全局设置
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        Self::tree_set(&self.settings, key, value)
    }

    async fn instance_tree(&self, instance_id: &str) -> Result<Tree> {
        {
            let trees = self.instance_trees.read().await;
            if let Some(tree) = trees.get(instance_id) {
                return Ok(tree.clone());
            }
        }

        let tree_name = format!("instance_{}", instance_id);
        let tree = self
            .db
            .open_tree(&tree_name)
            .map_err(|e| KMReaderError::KvStore(format!("打开实例 Tree 失败: {}", e)))?;
        let mut trees = self.instance_trees.write().await;
        trees.insert(instance_id.to_string(), tree.clone());
        Ok(tree)
    }

    /// 读取实例命名空间内的值
    pub async fn get<T: DeserializeOwned>(&self, instance_id: &str, key: &str) -> Result<Option<T>> {
        let tree = self.instance_tree(instance_id).await?;
        Self::tree_get(&tree, key)
    }

    /// 写入实例命名空间内的值
    pub async fn set<T: Serialize>(&self, instance_id: &str, key: &str, value: &T) -> Result<()> {
        let tree = self.instance_tree(instance_id).await?;
        Self::tree_set(&tree, key, value)
    }

    /// 删除实例命名空间内的值
    pub async fn remove(&self, instance_id: &str, key: &str) -> Result<()> {
        let tree = self.instance_tree(instance_id).await?;
        tree.remove(key)
            .map_err(|e| KMReaderError::KvStore(format!("删除键失败: {}", e)))?;
        Ok(())
    }

    /// 清空一个实例的全部键值
    pub async fn clear_instance(&self, instance_id: &str) -> Result<()> {
        {
            let mut trees = self.instance_trees.write().await;
            trees.remove(instance_id);
        }
        let tree_name = format!("instance_{}", instance_id);
        self.db
            .drop_tree(&tree_name)
            .map_err(|e| KMReaderError::KvStore(format!("删除实例 Tree 失败: {}", e)))?;
        Ok(())
    }

    fn tree_get<T: DeserializeOwned>(tree: &Tree, key: &str) -> Result<Option<T>> {
        let raw = tree
            .get(key)
            .map_err(|e| KMReaderError::KvStore(format!("读取键失败: {}", e)))?;
        match raw {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn tree_set<T: Serialize>(tree: &Tree, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        tree.insert(key, bytes)
            .map_err(|e| KMReaderError::KvStore(format!("写入键失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::new(dir.path()).await.unwrap();

        kv.set_setting(settings_keys::MAX_PAGE_CACHE_MB, &512u64)
            .unwrap();
        let value: Option<u64> = kv.get_setting(settings_keys::MAX_PAGE_CACHE_MB).unwrap();
        assert_eq!(value, Some(512));

        let missing: Option<u64> = kv.get_setting("missing").unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn instance_namespaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::new(dir.path()).await.unwrap();

        kv.set("inst-a", "session", &"cookie-a".to_string())
            .await
            .unwrap();
        kv.set("inst-b", "session", &"cookie-b".to_string())
            .await
            .unwrap();

        let a: Option<String> = kv.get("inst-a", "session").await.unwrap();
        let b: Option<String> = kv.get("inst-b", "session").await.unwrap();
        assert_eq!(a.as_deref(), Some("cookie-a"));
        assert_eq!(b.as_deref(), Some("cookie-b"));

        kv.clear_instance("inst-a").await.unwrap();
        let a: Option<String> = kv.get("inst-a", "session").await.unwrap();
        assert_eq!(a, None);
    }
}
