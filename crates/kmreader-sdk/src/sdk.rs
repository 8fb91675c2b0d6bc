//! KMReader SDK 门面 - 初始化、实例管理、事件连接
//!
//! 把存储、网关、同步引擎、离线管理器、页面缓存装配成一个整体：
//! - initialize: 建目录、开 sled 与 SQLite Actor、装配事件总线
//! - register_instance / login: 配置并认证一个服务器连接
//! - connect_events: 打开 SSE 监听，断流后定时重连
//! - set_offline: 切回在线时回放待确认进度并踢下载队列

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheStats, PageCache};
use crate::config::{InstanceConfig, KMReaderConfig};
use crate::error::{KMReaderError, Result};
use crate::events::{EventBus, StoreEvent};
use crate::gateway::sse::{parse_event, SseFrameParser};
use crate::gateway::HttpGateway;
use crate::offline::{OfflineManager, RuntimeFlags};
use crate::storage::kv::{settings_keys, KvStore};
use crate::storage::MirrorStore;
use crate::sync::{ProgressSyncService, SseDispatcher, SyncEngine};

/// 一个已注册实例的运行时部件
struct InstanceRuntime {
    config: InstanceConfig,
    gateway: Arc<HttpGateway>,
    engine: Arc<SyncEngine>,
    offline: Arc<OfflineManager>,
    progress: Arc<ProgressSyncService>,
    dispatcher: Arc<SseDispatcher>,
    sse_task: Option<JoinHandle<()>>,
}

/// KMReader SDK
pub struct KMReaderSDK {
    config: KMReaderConfig,
    kv: Arc<KvStore>,
    store: MirrorStore,
    events: EventBus,
    cache: Arc<PageCache>,
    flags: Arc<RuntimeFlags>,
    instances: RwLock<HashMap<String, InstanceRuntime>>,
}

impl KMReaderSDK {
    /// 初始化 SDK：建数据目录、打开存储、装配事件总线
    pub async fn initialize(config: KMReaderConfig) -> Result<Arc<Self>> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| KMReaderError::IO(format!("创建数据目录失败: {}", e)))?;

        let kv = Arc::new(KvStore::new(&config.data_dir).await?);
        let store = MirrorStore::open(&config.data_dir)?;
        let events = EventBus::new();

        // 缓存配额优先取持久化设置
        let max_mb: u64 = kv
            .get_setting(settings_keys::MAX_PAGE_CACHE_MB)?
            .unwrap_or(config.max_page_cache_mb);
        let cache = Arc::new(PageCache::new(&config.data_dir, max_mb));

        let flags = Arc::new(RuntimeFlags::new());
        if let Some(offline) = kv.get_setting::<bool>(settings_keys::OFFLINE_MODE)? {
            flags.set_offline(offline);
        }
        if let Some(paused) = kv.get_setting::<bool>(settings_keys::DOWNLOADS_PAUSED)? {
            flags.set_paused(paused);
        }

        info!("🚀 KMReader SDK 已初始化: {}", config.data_dir.display());
        Ok(Arc::new(Self {
            config,
            kv,
            store,
            events,
            cache,
            flags,
            instances: RwLock::new(HashMap::new()),
        }))
    }

    /// 注册一个服务器实例，装配其网关与同步部件
    pub async fn register_instance(self: &Arc<Self>, instance: InstanceConfig) -> Result<()> {
        let gateway = Arc::new(HttpGateway::new(&instance, self.config.request_timeout)?);
        let engine = Arc::new(SyncEngine::new(
            gateway.clone(),
            self.store.clone(),
            self.events.clone(),
            self.config.sync_page_size,
        ));
        let offline = OfflineManager::new(
            &self.config.data_dir,
            self.store.clone(),
            gateway.clone(),
            self.cache.clone(),
            self.events.clone(),
            self.flags.clone(),
            self.config.download_concurrency,
        );
        let progress = Arc::new(ProgressSyncService::new(
            self.store.clone(),
            gateway.clone(),
            engine.clone(),
            self.events.clone(),
            self.flags.clone(),
        ));
        let dispatcher = Arc::new(SseDispatcher::new(
            engine.clone(),
            self.store.clone(),
            offline.clone(),
            self.events.clone(),
        ));

        let mut instances = self.instances.write().await;
        instances.insert(
            instance.instance_id.clone(),
            InstanceRuntime {
                config: instance,
                gateway,
                engine,
                offline,
                progress,
                dispatcher,
                sse_task: None,
            },
        );
        Ok(())
    }

    /// 登录：凭证换会话 cookie，成功后记当前实例
    pub async fn login(&self, instance_id: &str) -> Result<()> {
        let instances = self.instances.read().await;
        let runtime = Self::runtime(&instances, instance_id)?;
        runtime.gateway.login().await?;
        self.kv
            .set_setting(settings_keys::CURRENT_INSTANCE, &instance_id.to_string())?;
        Ok(())
    }

    /// 打开 SSE 监听；已连接时先断开旧任务
    pub async fn connect_events(&self, instance_id: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        let Some(runtime) = instances.get_mut(instance_id) else {
            return Err(KMReaderError::NotInitialized(format!(
                "实例未注册: {}",
                instance_id
            )));
        };
        if let Some(task) = runtime.sse_task.take() {
            task.abort();
        }
        runtime.sse_task = Some(spawn_sse_listener(
            runtime.gateway.clone(),
            runtime.dispatcher.clone(),
            instance_id.to_string(),
            self.flags.clone(),
            self.config.sse_reconnect_delay,
        ));
        Ok(())
    }

    pub async fn disconnect_events(&self, instance_id: &str) {
        let mut instances = self.instances.write().await;
        if let Some(runtime) = instances.get_mut(instance_id) {
            if let Some(task) = runtime.sse_task.take() {
                task.abort();
            }
        }
    }

    /// 订阅本地镜像变更事件
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    pub async fn engine(&self, instance_id: &str) -> Result<Arc<SyncEngine>> {
        let instances = self.instances.read().await;
        Ok(Self::runtime(&instances, instance_id)?.engine.clone())
    }

    pub async fn offline_manager(&self, instance_id: &str) -> Result<Arc<OfflineManager>> {
        let instances = self.instances.read().await;
        Ok(Self::runtime(&instances, instance_id)?.offline.clone())
    }

    pub async fn progress_service(&self, instance_id: &str) -> Result<Arc<ProgressSyncService>> {
        let instances = self.instances.read().await;
        Ok(Self::runtime(&instances, instance_id)?.progress.clone())
    }

    pub async fn instance_config(&self, instance_id: &str) -> Result<InstanceConfig> {
        let instances = self.instances.read().await;
        Ok(Self::runtime(&instances, instance_id)?.config.clone())
    }

    // ---- 缓存 ----

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// 用户动作：清掉一本书的页面缓存（绕过配额逻辑）
    pub async fn clear_book_cache(&self, instance_id: &str, book_id: &str) {
        self.cache.clear_book(instance_id, book_id).await;
    }

    /// 调整缓存配额并持久化
    pub fn set_max_cache_size_mb(&self, max_mb: u64) -> Result<()> {
        self.kv
            .set_setting(settings_keys::MAX_PAGE_CACHE_MB, &max_mb)?;
        self.cache.set_max_size_mb(max_mb);
        Ok(())
    }

    // ---- 在线/离线 ----

    pub fn is_offline(&self) -> bool {
        self.flags.is_offline()
    }

    /// 切换离线模式；回到在线时回放待确认进度并踢下载队列
    pub async fn set_offline(&self, offline: bool) -> Result<()> {
        self.flags.set_offline(offline);
        self.kv.set_setting(settings_keys::OFFLINE_MODE, &offline)?;
        if offline {
            return Ok(());
        }

        let instances = self.instances.read().await;
        for (instance_id, runtime) in instances.iter() {
            runtime.progress.sync_pending_progress(instance_id).await;
            runtime.offline.trigger_sync(instance_id, true);
        }
        Ok(())
    }

    pub async fn set_downloads_paused(&self, paused: bool) -> Result<()> {
        self.flags.set_paused(paused);
        self.kv
            .set_setting(settings_keys::DOWNLOADS_PAUSED, &paused)?;
        if !paused {
            let instances = self.instances.read().await;
            for (instance_id, runtime) in instances.iter() {
                runtime.offline.trigger_sync(instance_id, true);
            }
        }
        Ok(())
    }

    /// 注销一个实例：断开事件流、清空镜像数据、离线文件与缓存
    pub async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        let runtime = {
            let mut instances = self.instances.write().await;
            instances.remove(instance_id)
        };
        if let Some(mut runtime) = runtime {
            if let Some(task) = runtime.sse_task.take() {
                task.abort();
            }
            runtime.offline.cancel_all_downloads(instance_id).await;
            runtime.offline.remove_offline_data(instance_id).await;
        }
        self.store.clear_instance_data(instance_id).await?;
        self.cache.clear_instance(instance_id).await;
        self.kv.clear_instance(instance_id).await?;
        info!("🗑️ 实例已移除: {}", instance_id);
        Ok(())
    }

    /// 关闭 SDK：停掉事件流与数据库 Actor
    pub async fn shutdown(&self) {
        let mut instances = self.instances.write().await;
        for runtime in instances.values_mut() {
            if let Some(task) = runtime.sse_task.take() {
                task.abort();
            }
        }
        self.store.shutdown();
        info!("✅ KMReader SDK 已关闭");
    }

    fn runtime<'a>(
        instances: &'a HashMap<String, InstanceRuntime>,
        instance_id: &str,
    ) -> Result<&'a InstanceRuntime> {
        instances.get(instance_id).ok_or_else(|| {
            KMReaderError::NotInitialized(format!("实例未注册: {}", instance_id))
        })
    }
}

/// SSE 监听循环：解析字节流 → 分发事件；断流/出错后延时重连
fn spawn_sse_listener(
    gateway: Arc<HttpGateway>,
    dispatcher: Arc<SseDispatcher>,
    instance_id: String,
    flags: Arc<RuntimeFlags>,
    reconnect_delay: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if flags.is_offline() {
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
            match gateway.sse_stream().await {
                Ok(stream) => {
                    tokio::pin!(stream);
                    let mut parser = SseFrameParser::new();
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => {
                                for (event_type, data) in parser.feed(&bytes) {
                                    if let Some(event) = parse_event(&event_type, &data) {
                                        dispatcher.handle_event(&instance_id, event).await;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("SSE 流错误: {}", e);
                                break;
                            }
                        }
                    }
                    info!("SSE 流结束，{:?} 后重连", reconnect_delay);
                }
                Err(e) => {
                    warn!("SSE 连接失败: {}", e);
                }
            }
            tokio::time::sleep(reconnect_delay).await;
        }
    })
}
