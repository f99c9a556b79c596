//! 服务连接
//!
//! [`ServiceConnection`] 把地址提供者与 tonic `Channel` 组合起来：
//!
//! - `pick()`：按负载均衡策略选择一个地址，返回缓存的 `Channel`
//! - `discover()`：把地址集合的变化转换为 `tower::discover::Change` 流，
//!   可以交给 `tower::balance` 使用（配合 `PendingRequestsDiscover` 提供负载度量）
//!
//! Channel 按地址缓存并惰性连接，地址离开集合时从缓存中移除。

use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tower::discover::Change;
use tracing::{debug, warn};

use super::balancer::{InFlight, LoadBalanceStrategy, LoadBalancer};
use super::resolver::{AddressProvider, ResolvedAddress};
use crate::error::{CoordError, Result};
use crate::task::TaskScope;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type ChannelCache = Arc<Mutex<HashMap<String, Channel>>>;

/// 面向单个服务的客户端连接
pub struct ServiceConnection {
    provider: Arc<dyn AddressProvider>,
    balancer: LoadBalancer,
    channels: ChannelCache,
    connect_timeout: Duration,
}

/// 一次选择的结果；持有期间计入该地址的在途请求数
#[derive(Debug)]
pub struct PickedChannel {
    channel: Channel,
    address: ResolvedAddress,
    _in_flight: InFlight,
}

impl PickedChannel {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn address(&self) -> &ResolvedAddress {
        &self.address
    }
}

impl ServiceConnection {
    pub fn new(provider: Arc<dyn AddressProvider>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            provider,
            balancer: LoadBalancer::new(strategy),
            channels: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn service_name(&self) -> &str {
        self.provider.service_name()
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.balancer.strategy()
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// 当前地址集合
    pub fn addresses(&self) -> Vec<ResolvedAddress> {
        self.provider.addresses()
    }

    /// 选择一个地址；`key` 仅用于一致性哈希
    pub fn pick(&self, key: Option<&str>) -> Result<PickedChannel> {
        let addresses = self.provider.addresses();
        self.evict_stale(&addresses);

        let target = self.balancer.select(&addresses, key).ok_or_else(|| {
            CoordError::unavailable(format!(
                "no healthy instance for service {}",
                self.service_name()
            ))
        })?;

        let channel = cached_channel(&self.channels, &target.address, self.connect_timeout)?;
        Ok(PickedChannel {
            channel,
            _in_flight: self.balancer.begin(&target.address),
            address: target.clone(),
        })
    }

    /// 选择一个 Channel（不跟踪在途请求）
    pub fn channel(&self) -> Result<Channel> {
        self.pick(None).map(|picked| picked.channel())
    }

    /// 地址集合变化的 tower discover 流，任务归属 `scope`
    pub fn discover(&self, scope: &TaskScope) -> ServiceDiscover {
        let (tx, rx) = mpsc::channel(64);
        let mut updates = self.provider.subscribe();
        let channels = self.channels.clone();
        let connect_timeout = self.connect_timeout;
        let service = self.service_name().to_string();

        scope.spawn("service-discover", async move {
            let mut current: HashSet<String> = HashSet::new();
            while let Some(addresses) = updates.next().await {
                let next: HashSet<String> = addresses.iter().map(|a| a.address.clone()).collect();

                for removed in current.difference(&next) {
                    debug!(service = %service, address = %removed, "Endpoint removed");
                    if tx.send(Change::Remove(removed.clone())).await.is_err() {
                        return;
                    }
                }
                for added in next.difference(&current) {
                    match cached_channel(&channels, added, connect_timeout) {
                        Ok(channel) => {
                            debug!(service = %service, address = %added, "Endpoint inserted");
                            if tx.send(Change::Insert(added.clone(), channel)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(service = %service, address = %added, error = %e, "Skipping invalid endpoint");
                        }
                    }
                }
                current = next;
            }
        });

        ServiceDiscover { rx }
    }

    fn evict_stale(&self, live: &[ResolvedAddress]) {
        let mut cache = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.retain(|address, _| live.iter().any(|a| &a.address == address));
        drop(cache);
        self.balancer.retain(live);
    }
}

fn cached_channel(cache: &ChannelCache, address: &str, connect_timeout: Duration) -> Result<Channel> {
    let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(channel) = cache.get(address) {
        return Ok(channel.clone());
    }

    let endpoint = Endpoint::from_shared(address.to_string())
        .map_err(|e| CoordError::validation(format!("Invalid endpoint {}: {}", address, e)))?
        .connect_timeout(connect_timeout);
    let channel = endpoint.connect_lazy();
    cache.insert(address.to_string(), channel.clone());
    Ok(channel)
}

/// tower discover 流
///
/// 实现 `Stream<Item = Result<Change<String, Channel>, Infallible>>`，
/// tower 0.5 据此自动实现 `Discover`。
pub struct ServiceDiscover {
    rx: mpsc::Receiver<Change<String, Channel>>,
}

impl Stream for ServiceDiscover {
    type Item = std::result::Result<Change<String, Channel>, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|change| change.map(Ok))
    }
}
