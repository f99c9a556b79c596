//! 地址提供者
//!
//! RPC 客户端通过 [`AddressProvider`] 获取某个服务的实时地址集合：
//! `addresses()` 返回当前集合，`subscribe()` 返回集合变化的流。
//! [`ServiceResolver`] 是基于注册中心 watch 的实现，每个服务名只构建一次。

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::instance::ServiceInstance;
use crate::task::TaskScope;
use crate::watch::Subscription;

/// 解析出的单个地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAddress {
    pub instance_id: String,
    /// gRPC URI，例如 `http://10.0.0.1:9000`
    pub address: String,
    pub weight: u32,
}

impl ResolvedAddress {
    pub fn new(instance_id: impl Into<String>, address: impl Into<String>, weight: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            address: address.into(),
            weight,
        }
    }

    pub fn from_instance(instance: &ServiceInstance) -> Self {
        Self::new(
            instance.instance_id.clone(),
            instance.to_grpc_uri(),
            instance.weight,
        )
    }
}

/// 服务地址提供者
pub trait AddressProvider: Send + Sync {
    fn service_name(&self) -> &str;

    /// 当前地址集合
    fn addresses(&self) -> Vec<ResolvedAddress>;

    /// 地址集合变化流，首个元素为订阅时的集合
    fn subscribe(&self) -> BoxStream<'static, Vec<ResolvedAddress>>;
}

/// 基于注册中心 watch 的地址提供者
pub struct ServiceResolver {
    service_name: String,
    state: watch::Receiver<Vec<ResolvedAddress>>,
    token: CancellationToken,
}

impl ServiceResolver {
    /// 以 `initial` 为初始集合，消费后续实例快照持续更新地址
    pub(crate) fn spawn(
        service_name: impl Into<String>,
        initial: &[ServiceInstance],
        mut snapshots: Subscription<Vec<ServiceInstance>>,
        scope: &TaskScope,
    ) -> Self {
        let service_name = service_name.into();
        let (tx, rx) = watch::channel(to_addresses(initial));
        let token = scope.token().child_token();

        let task_token = token.clone();
        let name = service_name.clone();
        scope.spawn("service-resolver", async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    snapshot = snapshots.recv() => {
                        let Some(instances) = snapshot else {
                            info!(service = %name, "Resolver subscription ended");
                            break;
                        };
                        let addresses = to_addresses(&instances);
                        let changed = tx.send_if_modified(|current| {
                            if *current == addresses {
                                false
                            } else {
                                *current = addresses;
                                true
                            }
                        });
                        if changed {
                            debug!(service = %name, count = tx.borrow().len(), "Resolved addresses updated");
                        }
                    }
                }
            }
            task_token.cancel();
        });

        info!(service = %service_name, "Service resolver started");
        Self {
            service_name,
            state: rx,
            token,
        }
    }

    /// 订阅已终止（注册中心关闭或 watch 重连耗尽）
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

impl AddressProvider for ServiceResolver {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn addresses(&self) -> Vec<ResolvedAddress> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> BoxStream<'static, Vec<ResolvedAddress>> {
        WatchStream::new(self.state.clone()).boxed()
    }
}

impl Drop for ServiceResolver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 固定地址集合，便于直连或测试
#[derive(Debug, Clone)]
pub struct StaticAddressProvider {
    service_name: String,
    addresses: Vec<ResolvedAddress>,
}

impl StaticAddressProvider {
    pub fn new(service_name: impl Into<String>, addresses: Vec<ResolvedAddress>) -> Self {
        Self {
            service_name: service_name.into(),
            addresses,
        }
    }
}

impl AddressProvider for StaticAddressProvider {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn addresses(&self) -> Vec<ResolvedAddress> {
        self.addresses.clone()
    }

    fn subscribe(&self) -> BoxStream<'static, Vec<ResolvedAddress>> {
        futures::stream::once(futures::future::ready(self.addresses.clone()))
            .chain(futures::stream::pending())
            .boxed()
    }
}

/// 按实例 ID 排序，保证相同集合得到相同顺序
fn to_addresses(instances: &[ServiceInstance]) -> Vec<ResolvedAddress> {
    let mut addresses: Vec<_> = instances.iter().map(ResolvedAddress::from_instance).collect();
    addresses.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::watch::subscription;

    #[tokio::test]
    async fn test_resolver_tracks_snapshots() {
        let scope = TaskScope::new();
        let (mut tx, sub) =
            subscription::<Vec<ServiceInstance>>(&WatchConfig::default(), scope.token(), "api");
        let resolver = ServiceResolver::spawn("api", &[], sub, &scope);
        let mut updates = resolver.subscribe();
        assert!(updates.next().await.unwrap().is_empty());

        let snapshot = vec![
            ServiceInstance::new("api", "b", "10.0.0.2:9000"),
            ServiceInstance::new("api", "a", "10.0.0.1:9000"),
        ];
        assert!(tx.deliver(snapshot).await);

        let addresses = updates.next().await.unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].address, "http://10.0.0.1:9000");
        assert_eq!(resolver.addresses(), addresses);

        drop(tx);
        scope.shutdown().await;
        assert!(resolver.is_closed());
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticAddressProvider::new(
            "api",
            vec![ResolvedAddress::new("a", "http://10.0.0.1:9000", 100)],
        );
        let mut stream = provider.subscribe();
        assert_eq!(stream.next().await.unwrap().len(), 1);
        assert_eq!(provider.service_name(), "api");
    }
}
