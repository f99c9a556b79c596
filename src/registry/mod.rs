//! 服务注册与发现
//!
//! 每个实例记录写在 `{key_prefix}/services/{service_name}/{instance_id}`，
//! 绑定在该实例独占的会话租约上：进程崩溃后租约过期，记录自动消失。
//!
//! - 注册时启动心跳任务，周期性刷新 `last_heartbeat`；心跳失败只记录日志，下一拍重试
//! - 发现只返回 `Healthy` 的实例
//! - Watch 为电平触发：订阅时先推送当前全集，之后每批变更都推送重新扫描的全集

pub mod balancer;
pub mod connection;
pub mod instance;
pub mod resolver;

pub use balancer::{InFlight, LoadBalanceStrategy, LoadBalancer};
pub use connection::{PickedChannel, ServiceConnection, ServiceDiscover};
pub use instance::{HealthStatus, ServiceInstance};
pub use resolver::{AddressProvider, ResolvedAddress, ServiceResolver, StaticAddressProvider};

use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorConfig, RegistryConfig, WatchConfig};
use crate::error::{CoordError, Result};
use crate::lease::{LeaseManager, Session};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::store::{KvStore, RangeOptions, Revision, WatchOptions, WatchStream};
use crate::task::TaskScope;
use crate::watch::{EventSender, Subscription, SubscriptionTable, subscription};
use instance::validate_service_name;

type SessionSlot = Arc<Mutex<Arc<Session>>>;

/// 本进程注册的实例
struct Registration {
    session: SessionSlot,
    heartbeat: CancellationToken,
}

pub struct ServiceRegistry {
    store: Arc<dyn KvStore>,
    leases: Arc<LeaseManager>,
    config: RegistryConfig,
    watch_config: WatchConfig,
    prefix: String,
    scope: TaskScope,
    registrations: Mutex<HashMap<String, Registration>>,
    subscriptions: Arc<SubscriptionTable>,
    resolvers: Mutex<HashMap<String, Arc<ServiceResolver>>>,
}

impl ServiceRegistry {
    pub fn new(leases: Arc<LeaseManager>, config: &CoordinatorConfig, scope: TaskScope) -> Self {
        Self {
            store: leases.store().clone(),
            leases,
            config: config.registry.clone(),
            watch_config: config.watch.clone(),
            prefix: format!("{}/services", config.key_prefix),
            scope,
            registrations: Mutex::new(HashMap::new()),
            subscriptions: Arc::new(SubscriptionTable::default()),
            resolvers: Mutex::new(HashMap::new()),
        }
    }

    fn instance_key(&self, name: &str, id: &str) -> String {
        format!("{}/{}/{}", self.prefix, name, id)
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("{}/{}/", self.prefix, name)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.scope.is_cancelled() {
            return Err(CoordError::Closed);
        }
        Ok(())
    }

    /// 注册实例；同一实例重复注册会复用会话并覆盖记录
    pub async fn register(&self, instance: ServiceInstance) -> Result<()> {
        instance.validate()?;
        self.ensure_open()?;

        let name = instance.service_name.clone();
        let id = instance.instance_id.clone();
        let key = self.instance_key(&name, &id);
        let logical_key = format!("registry:{}/{}", name, id);

        let session = self
            .leases
            .create_session(&logical_key, self.config.ttl())
            .await?;

        let mut record = instance;
        let now = Utc::now();
        record.registered_at = now;
        record.last_heartbeat = now;
        let value = serde_json::to_vec(&record)?;
        self.store
            .put(&key, value, Some(session.lease_id()))
            .await?;

        let slot: SessionSlot = Arc::new(Mutex::new(session.clone()));
        let heartbeat = self.scope.token().child_token();
        if self.config.enable_health_check {
            self.spawn_heartbeat(
                Heartbeat {
                    store: self.store.clone(),
                    leases: self.leases.clone(),
                    key: key.clone(),
                    logical_key,
                    ttl: self.config.ttl(),
                    template: record,
                    session: slot.clone(),
                },
                heartbeat.clone(),
            );
        }

        let previous = self.registrations.lock().await.insert(
            key.clone(),
            Registration {
                session: slot,
                heartbeat,
            },
        );
        if let Some(previous) = previous {
            previous.heartbeat.cancel();
        }

        info!(
            service = %name,
            instance_id = %id,
            lease_id = session.lease_id(),
            "Service registered"
        );
        Ok(())
    }

    fn spawn_heartbeat(&self, heartbeat: Heartbeat, token: CancellationToken) {
        let interval = self.config.heartbeat_interval();
        self.scope.spawn("registry-heartbeat", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat.beat().await {
                            warn!(key = %heartbeat.key, error = %e, "Heartbeat failed, retrying next tick");
                        }
                    }
                }
            }
        });
    }

    /// 注销实例：删除记录并撤销其租约
    ///
    /// 本进程没有该实例的注册、存储中也没有记录时返回 `NotFound`。
    pub async fn deregister(&self, name: &str, id: &str) -> Result<()> {
        validate_service_name(name)?;
        let key = self.instance_key(name, id);

        let registration = self.registrations.lock().await.remove(&key);
        let deleted = self.store.delete(&key, false).await?;

        match registration {
            Some(registration) => {
                registration.heartbeat.cancel();
                let session = registration.session.lock().await.clone();
                self.leases.close_session(&session).await?;
            }
            None if deleted == 0 => return Err(CoordError::key_not_found(&key)),
            None => {}
        }

        info!(service = %name, instance_id = %id, "Service deregistered");
        Ok(())
    }

    /// 发现健康实例
    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        validate_service_name(name)?;
        let (instances, _) = scan(self.store.as_ref(), &self.service_prefix(name), name).await?;
        Ok(instances)
    }

    /// 读取单个实例（不过滤健康状态）
    pub async fn get_instance(&self, name: &str, id: &str) -> Result<ServiceInstance> {
        validate_service_name(name)?;
        let key = self.instance_key(name, id);
        let kv = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CoordError::key_not_found(&key))?;
        Ok(serde_json::from_slice(&kv.value)?)
    }

    /// 当前已注册的服务名
    pub async fn list_services(&self) -> Result<Vec<String>> {
        let resp = self
            .store
            .range(&format!("{}/", self.prefix), RangeOptions::prefix())
            .await?;
        let names: BTreeSet<String> = resp
            .kvs
            .iter()
            .filter_map(|kv| serde_json::from_slice::<ServiceInstance>(&kv.value).ok())
            .map(|instance| instance.service_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// 更新实例健康状态（读-改-写，后写者胜出）
    pub async fn update_health(&self, name: &str, id: &str, health: HealthStatus) -> Result<()> {
        validate_service_name(name)?;
        let key = self.instance_key(name, id);
        let kv = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| CoordError::key_not_found(&key))?;

        let mut instance: ServiceInstance = serde_json::from_slice(&kv.value)?;
        instance.health = health;
        let lease = (kv.lease != 0).then_some(kv.lease);
        self.store
            .put(&key, serde_json::to_vec(&instance)?, lease)
            .await?;

        info!(service = %name, instance_id = %id, health = %health, "Instance health updated");
        Ok(())
    }

    /// 订阅服务的健康实例全集
    ///
    /// 首个元素是订阅时刻的 `discover` 结果。watch 断开后按配置重连，并重新推送全集；
    /// 重连耗尽时订阅结束（`recv` 返回 `None`）。
    pub async fn watch(&self, name: &str) -> Result<Subscription<Vec<ServiceInstance>>> {
        validate_service_name(name)?;
        self.ensure_open()?;

        let prefix = self.service_prefix(name);
        let (snapshot, revision) = scan(self.store.as_ref(), &prefix, name).await?;
        let stream = self
            .store
            .watch(&prefix, WatchOptions::prefix().from_revision(revision + 1))
            .await?;

        let (sender, sub) = subscription(&self.watch_config, self.scope.token(), &prefix);
        let id = self.subscriptions.insert(&prefix, sender.token().clone());

        let watcher = InstanceWatcher {
            store: self.store.clone(),
            prefix,
            name: name.to_string(),
            reconnect_attempts: self.watch_config.reconnect_attempts,
        };
        let subscriptions = self.subscriptions.clone();
        self.scope.spawn("registry-watch", async move {
            watcher.run(sender, snapshot, stream).await;
            subscriptions.remove(id);
        });

        debug!(service = %name, revision, "Registry watch started");
        Ok(sub)
    }

    /// 获取服务的客户端连接；地址解析器按服务名缓存
    pub async fn get_connection(
        &self,
        name: &str,
        strategy: LoadBalanceStrategy,
    ) -> Result<ServiceConnection> {
        let resolver = self.resolver(name).await?;
        Ok(ServiceConnection::new(resolver, strategy))
    }

    /// 服务名对应的地址解析器
    pub async fn resolver(&self, name: &str) -> Result<Arc<ServiceResolver>> {
        validate_service_name(name)?;
        let mut resolvers = self.resolvers.lock().await;
        if let Some(resolver) = resolvers.get(name)
            && !resolver.is_closed()
        {
            return Ok(resolver.clone());
        }

        let mut snapshots = self.watch(name).await?;
        let initial = snapshots.recv().await.ok_or(CoordError::Closed)?;
        let resolver = Arc::new(ServiceResolver::spawn(
            name,
            &initial,
            snapshots,
            &self.scope,
        ));
        resolvers.insert(name.to_string(), resolver.clone());
        Ok(resolver)
    }

    /// 活跃订阅数量
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// 停止心跳、取消订阅与解析器；租约由 `LeaseManager` 统一撤销
    pub(crate) async fn shutdown(&self) {
        for (_, registration) in self.registrations.lock().await.drain() {
            registration.heartbeat.cancel();
        }
        for (_, resolver) in self.resolvers.lock().await.drain() {
            resolver.close();
        }
        self.subscriptions.cancel_all();
    }
}

/// 扫描前缀，返回健康实例与读取时的 revision
async fn scan(
    store: &dyn KvStore,
    prefix: &str,
    name: &str,
) -> Result<(Vec<ServiceInstance>, Revision)> {
    let resp = store.range(prefix, RangeOptions::prefix()).await?;
    let mut instances = Vec::with_capacity(resp.kvs.len());
    for kv in &resp.kvs {
        match serde_json::from_slice::<ServiceInstance>(&kv.value) {
            // 服务名中可以包含 '/'，前缀扫描可能带出子服务的记录
            Ok(instance) if instance.service_name == name => {
                if instance.is_healthy() {
                    instances.push(instance);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(key = %kv.key, error = %e, "Skipping malformed instance record"),
        }
    }
    Ok((instances, resp.revision))
}

/// 心跳任务状态
struct Heartbeat {
    store: Arc<dyn KvStore>,
    leases: Arc<LeaseManager>,
    key: String,
    logical_key: String,
    ttl: Duration,
    template: ServiceInstance,
    session: SessionSlot,
}

impl Heartbeat {
    async fn beat(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if !session.is_alive() {
            warn!(key = %self.key, "Registration lease lost, re-registering");
            *session = self.leases.create_session(&self.logical_key, self.ttl).await?;
        }

        let mut record = match self.store.get(&self.key).await? {
            Some(kv) => serde_json::from_slice::<ServiceInstance>(&kv.value)?,
            None => self.template.clone(),
        };
        record.last_heartbeat = Utc::now();
        self.store
            .put(&self.key, serde_json::to_vec(&record)?, Some(session.lease_id()))
            .await?;
        debug!(key = %self.key, health = %record.health, "Heartbeat");
        Ok(())
    }
}

/// 单个 watch 订阅的分发循环
struct InstanceWatcher {
    store: Arc<dyn KvStore>,
    prefix: String,
    name: String,
    reconnect_attempts: usize,
}

impl InstanceWatcher {
    async fn run(
        &self,
        mut sender: EventSender<Vec<ServiceInstance>>,
        snapshot: Vec<ServiceInstance>,
        mut stream: WatchStream,
    ) {
        let token = sender.token().clone();
        if !sender.deliver(snapshot).await {
            return;
        }

        loop {
            let broken = tokio::select! {
                _ = token.cancelled() => return,
                msg = stream.next() => match msg {
                    Some(Ok(resp)) if resp.canceled || resp.compact_revision > 0 => true,
                    Some(Ok(resp)) => {
                        if resp.events.is_empty() {
                            continue;
                        }
                        match scan(self.store.as_ref(), &self.prefix, &self.name).await {
                            Ok((instances, _)) => {
                                if !sender.deliver(instances).await {
                                    return;
                                }
                            }
                            Err(e) => warn!(service = %self.name, error = %e, "Rescan after watch event failed"),
                        }
                        false
                    }
                    Some(Err(e)) => {
                        warn!(service = %self.name, error = %e, "Registry watch stream failed");
                        true
                    }
                    None => true,
                },
            };

            if broken {
                match self.reconnect(&token).await {
                    Some((instances, next)) => {
                        stream = next;
                        if !sender.deliver(instances).await {
                            return;
                        }
                    }
                    None => {
                        warn!(service = %self.name, "Registry watch closed after reconnect attempts exhausted");
                        return;
                    }
                }
            }
        }
    }

    /// 重新扫描并从扫描 revision 之后继续 watch
    async fn reconnect(
        &self,
        token: &CancellationToken,
    ) -> Option<(Vec<ServiceInstance>, WatchStream)> {
        let backoff = ExponentialBackoffPolicy::new(
            self.reconnect_attempts,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .with_jitter(0.1);

        for attempt in 1..=self.reconnect_attempts {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(backoff.backoff_duration(attempt)) => {}
            }

            let result = async {
                let (instances, revision) =
                    scan(self.store.as_ref(), &self.prefix, &self.name).await?;
                let stream = self
                    .store
                    .watch(&self.prefix, WatchOptions::prefix().from_revision(revision + 1))
                    .await?;
                Ok::<_, CoordError>((instances, stream))
            }
            .await;

            match result {
                Ok(resumed) => {
                    info!(service = %self.name, attempt, "Registry watch reconnected");
                    return Some(resumed);
                }
                Err(e) => {
                    warn!(service = %self.name, attempt, error = %e, "Registry watch reconnect failed");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        scope: TaskScope,
        registry: ServiceRegistry,
    }

    fn fixture_with(config: CoordinatorConfig) -> Fixture {
        let store = MemoryStore::new();
        let scope = TaskScope::new();
        let leases = Arc::new(LeaseManager::new(store.clone(), scope.clone()));
        let registry = ServiceRegistry::new(leases, &config, scope.child());
        Fixture {
            store,
            scope,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CoordinatorConfig::test().with_key_prefix("/t"))
    }

    fn api(id: &str, address: &str) -> ServiceInstance {
        ServiceInstance::new("api", id, address)
    }

    #[tokio::test]
    async fn test_register_discover_deregister() {
        let fx = fixture();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();

        let found = fx.registry.discover("api").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "10.0.0.1:9000");
        assert!(fx.store.get("/t/services/api/a1").await.unwrap().is_some());

        fx.registry.deregister("api", "a1").await.unwrap();
        assert!(fx.registry.discover("api").await.unwrap().is_empty());
        assert_eq!(fx.store.lease_count(), 0);

        let err = fx.registry.deregister("api", "a1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_register_validates_before_io() {
        let fx = fixture();
        let err = fx
            .registry
            .register(ServiceInstance::new("api", "", "10.0.0.1:9000"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));
        assert_eq!(fx.store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_filtered() {
        let fx = fixture();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();
        fx.registry.register(api("a2", "10.0.0.2:9000")).await.unwrap();

        fx.registry
            .update_health("api", "a1", HealthStatus::Unhealthy)
            .await
            .unwrap();
        let found = fx.registry.discover("api").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instance_id, "a2");

        let a1 = fx.registry.get_instance("api", "a1").await.unwrap();
        assert_eq!(a1.health, HealthStatus::Unhealthy);
        let kv = fx.store.get("/t/services/api/a1").await.unwrap().unwrap();
        assert_ne!(kv.lease, 0);

        fx.registry
            .update_health("api", "a1", HealthStatus::Healthy)
            .await
            .unwrap();
        assert_eq!(fx.registry.discover("api").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_nested_service_names_do_not_leak() {
        let fx = fixture();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();
        fx.registry
            .register(ServiceInstance::new("api/admin", "x1", "10.0.0.9:9000"))
            .await
            .unwrap();

        assert_eq!(fx.registry.discover("api").await.unwrap().len(), 1);
        assert_eq!(
            fx.registry.list_services().await.unwrap(),
            vec!["api".to_string(), "api/admin".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_refreshes_and_preserves_health() {
        let fx = fixture();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();
        fx.registry
            .update_health("api", "a1", HealthStatus::Maintenance)
            .await
            .unwrap();
        let before = fx.registry.get_instance("api", "a1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        let after = fx.registry.get_instance("api", "a1").await.unwrap();
        assert_eq!(after.health, HealthStatus::Maintenance);
        assert!(after.last_heartbeat >= before.last_heartbeat);
        assert_eq!(after.registered_at, before.registered_at);
    }

    #[tokio::test]
    async fn test_watch_starts_with_snapshot_then_tracks_changes() {
        let fx = fixture();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();

        let mut sub = fx.registry.watch("api").await.unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(first, fx.registry.discover("api").await.unwrap());

        fx.registry.register(api("a2", "10.0.0.2:9000")).await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(second.len(), 2);

        fx.registry.deregister("api", "a1").await.unwrap();
        let third = sub.recv().await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].instance_id, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_resyncs_after_stream_break() {
        let fx = fixture();
        let mut sub = fx.registry.watch("api").await.unwrap();
        assert!(sub.recv().await.unwrap().is_empty());

        fx.store.break_watches();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let snapshot = sub.recv().await.unwrap();
                if !snapshot.is_empty() {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(snapshot[0].instance_id, "a1");
    }

    #[tokio::test]
    async fn test_get_connection_tracks_registry() {
        let fx = fixture();
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();

        let conn = fx
            .registry
            .get_connection("api", LoadBalanceStrategy::RoundRobin)
            .await
            .unwrap();
        let picked = conn.pick(None).unwrap();
        assert_eq!(picked.address().address, "http://10.0.0.1:9000");

        let resolver = fx.registry.resolver("api").await.unwrap();
        let mut updates = resolver.subscribe();

        fx.registry.deregister("api", "a1").await.unwrap();
        loop {
            if updates.next().await.unwrap().is_empty() {
                break;
            }
        }
        assert!(conn.pick(None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_owner_registration_expires_after_ttl() {
        let fx = fixture();
        let observer = {
            let leases = Arc::new(LeaseManager::new(fx.store.clone(), fx.scope.child()));
            let config = CoordinatorConfig::test().with_key_prefix("/t");
            ServiceRegistry::new(leases, &config, fx.scope.child())
        };
        fx.registry.register(api("a1", "10.0.0.1:9000")).await.unwrap();
        let mut sub = observer.watch("api").await.unwrap();
        assert_eq!(sub.recv().await.unwrap().len(), 1);

        // 心跳与续约同时停止，等同于进程崩溃
        fx.registry.shutdown().await;
        fx.store.pause_keep_alives(true);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(observer.discover("api").await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(observer.discover("api").await.unwrap().is_empty());
        assert!(observer.get_instance("api", "a1").await.unwrap_err().is_not_found());

        let snapshot = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_subscriptions() {
        let fx = fixture();
        let mut sub = fx.registry.watch("api").await.unwrap();
        assert!(sub.recv().await.is_some());
        assert_eq!(fx.registry.subscription_count(), 1);

        fx.registry.shutdown().await;
        fx.scope.shutdown().await;
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            fx.registry.watch("api").await,
            Err(CoordError::Closed)
        ));
    }
}
