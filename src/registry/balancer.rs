//! 负载均衡模块
//!
//! 提供多种负载均衡策略，用于从解析出的地址集合中选择一个

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::resolver::ResolvedAddress;
use crate::error::CoordError;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 轮询（Round Robin）
    #[default]
    RoundRobin,
    /// 随机（Random）
    Random,
    /// 按权重随机
    Weighted,
    /// 最少连接（Least Connections），基于本进程的在途请求计数
    LeastConnections,
    /// 一致性哈希（Consistent Hash），需要调用方提供哈希键
    ConsistentHash,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::Weighted => "weighted",
            LoadBalanceStrategy::LeastConnections => "least_connections",
            LoadBalanceStrategy::ConsistentHash => "consistent_hash",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            "random" => Ok(LoadBalanceStrategy::Random),
            "weighted" | "weighted_random" => Ok(LoadBalanceStrategy::Weighted),
            "least_connections" | "least_conn" => Ok(LoadBalanceStrategy::LeastConnections),
            "consistent_hash" => Ok(LoadBalanceStrategy::ConsistentHash),
            other => Err(CoordError::validation(format!(
                "unknown load balance strategy: {}",
                other
            ))),
        }
    }
}

type ConnectionCounts = Arc<Mutex<HashMap<String, usize>>>;

/// 每个地址在哈希环上的虚拟节点数
const VIRTUAL_NODES: usize = 160;

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// 一致性哈希环
///
/// 节点以地址为标识，成员变化时只有落在增删节点区间内的键会迁移。
#[derive(Debug, Default)]
struct HashRing {
    /// 排序去重后的成员地址，用于判断是否需要重建
    members: Vec<String>,
    nodes: Vec<(u64, String)>,
}

impl HashRing {
    fn members_of(targets: &[ResolvedAddress]) -> Vec<String> {
        let mut members: Vec<String> = targets.iter().map(|t| t.address.clone()).collect();
        members.sort();
        members.dedup();
        members
    }

    fn build(members: Vec<String>) -> Self {
        let mut nodes = Vec::with_capacity(members.len() * VIRTUAL_NODES);
        for address in &members {
            for replica in 0..VIRTUAL_NODES {
                nodes.push((hash_of(&format!("{}#{}", address, replica)), address.clone()));
            }
        }
        nodes.sort();
        Self { members, nodes }
    }

    /// 顺时针找到第一个不小于键哈希的节点，越过末尾则回到环首
    fn locate(&self, key: &str) -> Option<&str> {
        let hash = hash_of(key);
        let index = self.nodes.partition_point(|(node, _)| *node < hash);
        self.nodes
            .get(index)
            .or_else(|| self.nodes.first())
            .map(|(_, address)| address.as_str())
    }
}

/// 负载均衡器
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalanceStrategy,
    round_robin_index: AtomicUsize,
    connection_counts: ConnectionCounts,
    ring: Mutex<HashRing>,
}

impl LoadBalancer {
    /// 创建新的负载均衡器
    pub fn new(strategy: LoadBalanceStrategy) -> Self {
        Self {
            strategy,
            round_robin_index: AtomicUsize::new(0),
            connection_counts: Arc::new(Mutex::new(HashMap::new())),
            ring: Mutex::new(HashRing::default()),
        }
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy
    }

    /// 选择一个地址
    pub fn select<'a>(
        &self,
        targets: &'a [ResolvedAddress],
        key: Option<&str>,
    ) -> Option<&'a ResolvedAddress> {
        if targets.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(targets),
            LoadBalanceStrategy::Random => self.select_random(targets),
            LoadBalanceStrategy::Weighted => self.select_weighted(targets),
            LoadBalanceStrategy::LeastConnections => self.select_least_connections(targets),
            LoadBalanceStrategy::ConsistentHash => {
                self.select_consistent_hash(targets, key.unwrap_or(""))
            }
        }
    }

    /// 轮询选择
    fn select_round_robin<'a>(&self, targets: &'a [ResolvedAddress]) -> Option<&'a ResolvedAddress> {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        targets.get(index % targets.len())
    }

    /// 随机选择
    fn select_random<'a>(&self, targets: &'a [ResolvedAddress]) -> Option<&'a ResolvedAddress> {
        let index = rand::thread_rng().gen_range(0..targets.len());
        targets.get(index)
    }

    /// 加权随机；权重全为 0 时退化为随机
    fn select_weighted<'a>(&self, targets: &'a [ResolvedAddress]) -> Option<&'a ResolvedAddress> {
        let total: u64 = targets.iter().map(|t| t.weight as u64).sum();
        if total == 0 {
            return self.select_random(targets);
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for target in targets {
            let weight = target.weight as u64;
            if point < weight {
                return Some(target);
            }
            point -= weight;
        }
        targets.last()
    }

    /// 一致性哈希选择
    fn select_consistent_hash<'a>(
        &self,
        targets: &'a [ResolvedAddress],
        key: &str,
    ) -> Option<&'a ResolvedAddress> {
        let members = HashRing::members_of(targets);
        let mut ring = self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if ring.members != members {
            *ring = HashRing::build(members);
        }
        let address = ring.locate(key)?;
        targets.iter().find(|t| t.address == address)
    }

    /// 最少连接选择
    fn select_least_connections<'a>(
        &self,
        targets: &'a [ResolvedAddress],
    ) -> Option<&'a ResolvedAddress> {
        let counts = self.counts();
        targets
            .iter()
            .min_by_key(|target| counts.get(&target.address).copied().unwrap_or(0))
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.connection_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 增加连接数
    pub fn increment_connections(&self, address: &str) {
        *self.counts().entry(address.to_string()).or_insert(0) += 1;
    }

    /// 减少连接数
    pub fn decrement_connections(&self, address: &str) {
        decrement(&self.connection_counts, address);
    }

    pub fn connections(&self, address: &str) -> usize {
        self.counts().get(address).copied().unwrap_or(0)
    }

    /// 登记一个在途请求，守卫释放时自动减计数
    pub fn begin(&self, address: &str) -> InFlight {
        self.increment_connections(address);
        InFlight {
            counts: self.connection_counts.clone(),
            address: address.to_string(),
        }
    }

    /// 丢弃已离开地址集合的计数
    pub fn retain(&self, live: &[ResolvedAddress]) {
        self.counts()
            .retain(|address, count| *count > 0 || live.iter().any(|t| &t.address == address));
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalanceStrategy::RoundRobin)
    }
}

fn decrement(counts: &ConnectionCounts, address: &str) {
    let mut counts = counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(count) = counts.get_mut(address)
        && *count > 0
    {
        *count -= 1;
    }
}

/// 在途请求守卫
#[derive(Debug)]
pub struct InFlight {
    counts: ConnectionCounts,
    address: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        decrement(&self.counts, &self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<ResolvedAddress> {
        vec![
            ResolvedAddress::new("a", "10.0.0.1:9000", 1),
            ResolvedAddress::new("b", "10.0.0.2:9000", 0),
            ResolvedAddress::new("c", "10.0.0.3:9000", 1),
        ]
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::RoundRobin);
        let t = targets();
        let picks: Vec<_> = (0..6)
            .map(|_| lb.select(&t, None).unwrap().instance_id.clone())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::Weighted);
        let t = targets();
        for _ in 0..200 {
            assert_ne!(lb.select(&t, None).unwrap().instance_id, "b");
        }
    }

    #[test]
    fn test_least_connections_follows_in_flight_guards() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::LeastConnections);
        let t = targets();
        let first = lb.begin("10.0.0.1:9000");
        let _second = lb.begin("10.0.0.2:9000");
        assert_eq!(lb.select(&t, None).unwrap().instance_id, "c");

        drop(first);
        assert_eq!(lb.connections("10.0.0.1:9000"), 0);
        assert_eq!(lb.select(&t, None).unwrap().instance_id, "a");
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::ConsistentHash);
        let t = targets();
        let first = lb.select(&t, Some("user-7")).unwrap().address.clone();
        for _ in 0..10 {
            assert_eq!(lb.select(&t, Some("user-7")).unwrap().address, first);
        }
    }

    #[test]
    fn test_consistent_hash_only_moves_keys_of_removed_node() {
        let lb = LoadBalancer::new(LoadBalanceStrategy::ConsistentHash);
        let mut t = targets();
        t.push(ResolvedAddress::new("d", "10.0.0.4:9000", 1));
        let keys: Vec<String> = (0..1000).map(|i| format!("user-{i}")).collect();

        let before: Vec<String> = keys
            .iter()
            .map(|k| lb.select(&t, Some(k.as_str())).unwrap().address.clone())
            .collect();
        for target in &t {
            let owned = before.iter().filter(|a| **a == target.address).count();
            assert!(owned > 100, "{} owns only {} keys", target.address, owned);
        }

        let removed = t.remove(1).address;
        let mut moved = 0;
        for (key, previous) in keys.iter().zip(&before) {
            let now = &lb.select(&t, Some(key.as_str())).unwrap().address;
            if now != previous {
                assert_eq!(previous, &removed, "key {} moved off a surviving node", key);
                moved += 1;
            }
        }
        assert_eq!(moved, before.iter().filter(|a| **a == removed).count());
    }

    #[test]
    fn test_empty_targets() {
        let lb = LoadBalancer::default();
        assert!(lb.select(&[], None).is_none());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "least-connections".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::LeastConnections
        );
        assert_eq!(
            "ROUND_ROBIN".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::RoundRobin
        );
        assert!("fastest".parse::<LoadBalanceStrategy>().is_err());
        assert_eq!(LoadBalanceStrategy::Weighted.to_string(), "weighted");
    }
}
