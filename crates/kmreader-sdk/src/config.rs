//! SDK 配置 - 数据目录、实例（服务器连接）、缓存与分页参数
//!
//! 一个本地库可以同时镜像多个 Komga 实例；每个实例有独立的
//! instance_id（UUID，作为复合主键前缀）、服务器地址与凭证。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KMReaderError, Result};

/// 认证凭证：Basic 用户名密码，或长期 API Key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Credential {
    Basic { username: String, password: String },
    ApiKey(String),
}

/// 一个已配置的服务器连接
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// 本地生成的实例 ID（UUID，不含下划线）
    pub instance_id: String,
    /// 显示名称
    pub name: String,
    /// 服务器地址，例如 https://komga.example.com
    pub server_url: String,
    /// 认证方式
    pub credential: Credential,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, server_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            instance_id: Uuid::new_v4().simple().to_string(),
            name: name.into(),
            server_url: server_url.into(),
            credential,
        }
    }
}

/// KMReader SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMReaderConfig {
    /// 数据存储目录（SQLite、sled、离线文件、页面缓存都在其下）
    pub data_dir: PathBuf,
    /// 页面缓存配额（MB）
    pub max_page_cache_mb: u64,
    /// 全量同步使用的分页大小
    pub sync_page_size: usize,
    /// 下载页面时的并发数
    pub download_concurrency: usize,
    /// HTTP 请求超时
    pub request_timeout: Duration,
    /// SSE 断线后的重连间隔
    pub sse_reconnect_delay: Duration,
}

impl Default for KMReaderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./kmreader-data"),
            max_page_cache_mb: 2048,
            sync_page_size: 100,
            download_concurrency: 4,
            request_timeout: Duration::from_secs(30),
            sse_reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl KMReaderConfig {
    pub fn builder() -> KMReaderConfigBuilder {
        KMReaderConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(KMReaderError::InvalidInput("data_dir 不能为空".to_string()));
        }
        if self.sync_page_size == 0 {
            return Err(KMReaderError::InvalidInput(
                "sync_page_size 必须大于 0".to_string(),
            ));
        }
        if self.download_concurrency == 0 {
            return Err(KMReaderError::InvalidInput(
                "download_concurrency 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// KMReader SDK 配置构建器
pub struct KMReaderConfigBuilder {
    config: KMReaderConfig,
}

impl KMReaderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: KMReaderConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn max_page_cache_mb(mut self, mb: u64) -> Self {
        self.config.max_page_cache_mb = mb;
        self
    }

    pub fn sync_page_size(mut self, size: usize) -> Self {
        self.config.sync_page_size = size;
        self
    }

    pub fn download_concurrency(mut self, n: usize) -> Self {
        self.config.download_concurrency = n;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn build(self) -> KMReaderConfig {
        self.config
    }
}

impl Default for KMReaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
