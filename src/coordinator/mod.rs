//! 协调器门面
//!
//! `Coordinator` 持有唯一的存储连接，并把锁、注册中心、配置中心组合在一起。
//! 它是一个廉价可克隆的句柄，调用方显式构造并通过依赖注入传递；不存在全局默认实例。

mod module;

pub use module::{ModuleConfig, ModuleCoordinator, ModuleLocks, ModuleRegistry};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::config_center::ConfigCenter;
use crate::error::{CoordError, Result};
use crate::lease::LeaseManager;
use crate::lock::LockService;
use crate::registry::ServiceRegistry;
use crate::store::{EtcdStore, KvStore, StoreAdapter};
use crate::task::TaskScope;

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: CoordinatorConfig,
    store: Arc<StoreAdapter>,
    leases: Arc<LeaseManager>,
    locks: LockService,
    registry: ServiceRegistry,
    config_center: ConfigCenter,
    scope: TaskScope,
    closed: AtomicBool,
}

impl Coordinator {
    /// 校验配置、连接 etcd 并完成连通性探测
    pub async fn open(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let store = EtcdStore::connect(&config).await?;
        Self::with_store(config, Arc::new(store)).await
    }

    /// 使用给定的存储实现构造（测试中传入 `MemoryStore`）
    pub async fn with_store(config: CoordinatorConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        config.validate()?;

        let adapter = Arc::new(StoreAdapter::from_config(store, &config));
        adapter.ping().await?;

        let scope = TaskScope::new();
        let store: Arc<dyn KvStore> = adapter.clone();
        let leases = Arc::new(LeaseManager::new(store.clone(), scope.clone()));
        let locks = LockService::new(leases.clone(), &config, scope.token().clone());
        let registry = ServiceRegistry::new(leases.clone(), &config, scope.clone());
        let config_center = ConfigCenter::new(store, &config, scope.clone());

        info!(
            endpoints = ?config.endpoints,
            key_prefix = %config.key_prefix,
            "Coordinator opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store: adapter,
                leases,
                locks,
                registry,
                config_center,
                scope,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn lock(&self) -> &LockService {
        &self.inner.locks
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ConfigCenter {
        &self.inner.config_center
    }

    /// 构造时使用的配置
    pub fn options(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.inner.leases
    }

    /// 存储健康探测
    pub async fn ping(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CoordError::Closed);
        }
        self.inner.store.ping().await
    }

    /// 以 `name` 为命名空间的视图，与本协调器共享连接
    pub fn module(&self, name: &str) -> Result<ModuleCoordinator> {
        ModuleCoordinator::new(self.clone(), name)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// 关闭协调器（幂等）
    ///
    /// 依次取消订阅、撤销本实例持有的全部租约、停止后台任务。
    /// 撤销租约失败时返回第一个错误，但关闭流程总会完整执行。
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.registry.shutdown().await;
        self.inner.config_center.shutdown();
        let revoked = self.inner.leases.close_all().await;
        if let Err(e) = &revoked {
            warn!(error = %e, "Failed to revoke some leases on close");
        }
        self.inner.scope.shutdown().await;

        info!("Coordinator closed");
        revoked
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.scope.token().cancel();
    }
}
