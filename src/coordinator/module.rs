//! 命名空间视图
//!
//! 每个包装器只持有共享服务的引用和命名空间，转发前把键改写为 `{namespace}/{key}`；
//! 注册中心改写的是服务名。关闭视图不会影响共享的协调器。

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::Coordinator;
use crate::config_center::{ConfigCenter, ConfigChange, ConfigEntry, ConfigMeta, ConfigVersion};
use crate::error::{CoordError, Result};
use crate::lock::{Lock, LockService, ReentrantLock};
use crate::registry::{
    HealthStatus, LoadBalanceStrategy, ServiceConnection, ServiceInstance, ServiceRegistry,
};
use crate::watch::Subscription;

pub struct ModuleCoordinator {
    coordinator: Coordinator,
    namespace: String,
}

impl ModuleCoordinator {
    pub(super) fn new(coordinator: Coordinator, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') {
            return Err(CoordError::validation(
                "module name must be non-empty and must not contain '/'",
            ));
        }
        Ok(Self {
            coordinator,
            namespace: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.namespace
    }

    pub fn lock(&self) -> ModuleLocks<'_> {
        ModuleLocks {
            locks: self.coordinator.lock(),
            namespace: &self.namespace,
        }
    }

    pub fn registry(&self) -> ModuleRegistry<'_> {
        ModuleRegistry {
            registry: self.coordinator.registry(),
            namespace: &self.namespace,
        }
    }

    pub fn config(&self) -> ModuleConfig<'_> {
        ModuleConfig {
            center: self.coordinator.config(),
            namespace: &self.namespace,
        }
    }

    /// 释放视图；共享连接保持打开
    pub fn close(self) {}
}

fn scoped(namespace: &str, key: &str) -> String {
    format!("{}/{}", namespace, key)
}

pub struct ModuleLocks<'a> {
    locks: &'a LockService,
    namespace: &'a str,
}

impl ModuleLocks<'_> {
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.locks.acquire(&scoped(self.namespace, key), ttl).await
    }

    pub async fn acquire_with_timeout(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Lock> {
        self.locks
            .acquire_with_timeout(&scoped(self.namespace, key), ttl, timeout)
            .await
    }

    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.locks.try_acquire(&scoped(self.namespace, key), ttl).await
    }

    pub async fn acquire_reentrant(&self, key: &str, ttl: Duration) -> Result<ReentrantLock> {
        self.locks
            .acquire_reentrant(&scoped(self.namespace, key), ttl)
            .await
    }

    pub async fn acquire_read_lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.locks
            .acquire_read_lock(&scoped(self.namespace, key), ttl)
            .await
    }

    pub async fn acquire_write_lock(&self, key: &str, ttl: Duration) -> Result<Lock> {
        self.locks
            .acquire_write_lock(&scoped(self.namespace, key), ttl)
            .await
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        self.locks.is_locked(&scoped(self.namespace, key)).await
    }
}

/// 注册中心视图
///
/// 服务名以 `{namespace}/{name}` 写入存储，返回的实例保留存储中的完整服务名。
pub struct ModuleRegistry<'a> {
    registry: &'a ServiceRegistry,
    namespace: &'a str,
}

impl ModuleRegistry<'_> {
    pub async fn register(&self, mut instance: ServiceInstance) -> Result<()> {
        instance.service_name = scoped(self.namespace, &instance.service_name);
        self.registry.register(instance).await
    }

    pub async fn deregister(&self, name: &str, id: &str) -> Result<()> {
        self.registry
            .deregister(&scoped(self.namespace, name), id)
            .await
    }

    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        self.registry.discover(&scoped(self.namespace, name)).await
    }

    pub async fn get_instance(&self, name: &str, id: &str) -> Result<ServiceInstance> {
        self.registry
            .get_instance(&scoped(self.namespace, name), id)
            .await
    }

    pub async fn update_health(&self, name: &str, id: &str, health: HealthStatus) -> Result<()> {
        self.registry
            .update_health(&scoped(self.namespace, name), id, health)
            .await
    }

    pub async fn watch(&self, name: &str) -> Result<Subscription<Vec<ServiceInstance>>> {
        self.registry.watch(&scoped(self.namespace, name)).await
    }

    pub async fn get_connection(
        &self,
        name: &str,
        strategy: LoadBalanceStrategy,
    ) -> Result<ServiceConnection> {
        self.registry
            .get_connection(&scoped(self.namespace, name), strategy)
            .await
    }

    /// 本命名空间下的服务名（不含命名空间前缀）
    pub async fn list_services(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/", self.namespace);
        Ok(self
            .registry
            .list_services()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

pub struct ModuleConfig<'a> {
    center: &'a ConfigCenter,
    namespace: &'a str,
}

impl ModuleConfig<'_> {
    pub async fn get(&self, key: &str) -> Result<ConfigEntry> {
        self.center.get(&scoped(self.namespace, key)).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.center.get_as(&scoped(self.namespace, key)).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: i64,
    ) -> Result<i64> {
        self.center
            .set(&scoped(self.namespace, key), value, expected_version)
            .await
    }

    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected_version: i64,
    ) -> Result<i64> {
        self.center
            .set_as(&scoped(self.namespace, key), value, expected_version)
            .await
    }

    pub async fn set_with_meta(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: i64,
        meta: ConfigMeta,
    ) -> Result<i64> {
        self.center
            .set_with_meta(&scoped(self.namespace, key), value, expected_version, meta)
            .await
    }

    pub async fn delete(&self, key: &str, expected_version: i64) -> Result<()> {
        self.center
            .delete(&scoped(self.namespace, key), expected_version)
            .await
    }

    pub async fn get_version(&self, key: &str) -> Result<i64> {
        self.center.get_version(&scoped(self.namespace, key)).await
    }

    pub async fn get_history(&self, key: &str, limit: usize) -> Result<Vec<ConfigVersion>> {
        self.center
            .get_history(&scoped(self.namespace, key), limit)
            .await
    }

    /// 本命名空间下的键（不含命名空间前缀）
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let namespace = format!("{}/", self.namespace);
        Ok(self
            .center
            .list(&scoped(self.namespace, prefix))
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&namespace).map(str::to_string))
            .collect())
    }

    pub async fn watch(&self, key: &str) -> Result<Subscription<ConfigChange>> {
        self.center.watch(&scoped(self.namespace, key)).await
    }

    pub async fn watch_prefix(&self, prefix: &str) -> Result<Subscription<ConfigChange>> {
        self.center
            .watch_prefix(&scoped(self.namespace, prefix))
            .await
    }
}
