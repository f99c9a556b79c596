//! 存储适配层
//!
//! `KvStore` 是上层（租约、锁、注册中心、配置中心）唯一依赖的存储接口，
//! 只暴露协调逻辑需要的最小原语集合：
//!
//! - **读写**：`range` / `put` / `delete`
//! - **租约**：`grant` / `keep_alive` / `revoke` / `time_to_live`
//! - **事件**：`watch`（支持前缀与起始 revision）
//! - **事务**：`txn`（等值比较 + 成功/失败分支）
//!
//! 实现：
//! - [`EtcdStore`]：基于 etcd-client 的生产实现
//! - [`MemoryStore`]：进程内实现，语义与 etcd 对齐，用于测试
//! - [`StoreAdapter`]：装饰器，为任意实现叠加超时与指数退避重试

pub mod adapter;
pub mod etcd;
pub mod memory;

pub use adapter::StoreAdapter;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// 全局单调递增的存储 revision
pub type Revision = i64;

/// 租约 ID
pub type LeaseId = i64;

/// 存储中的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// 创建该键时的 revision
    pub create_revision: Revision,
    /// 最近一次修改的 revision
    pub mod_revision: Revision,
    /// 自创建以来的修改次数
    pub version: i64,
    /// 绑定的租约，0 表示未绑定
    pub lease: LeaseId,
}

/// 范围查询选项
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    pub prefix: bool,
    /// 按键降序返回
    pub descending: bool,
    pub limit: Option<usize>,
}

impl RangeOptions {
    pub fn prefix() -> Self {
        Self {
            prefix: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 范围查询结果，`revision` 为读取时刻的存储 revision
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: Revision,
}

/// Watch 选项
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub prefix: bool,
    /// 从指定 revision（含）开始回放事件
    pub start_revision: Option<Revision>,
}

impl WatchOptions {
    pub fn prefix() -> Self {
        Self {
            prefix: true,
            start_revision: None,
        }
    }

    #[must_use]
    pub fn from_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// 单个键的变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// 删除事件中只有 `key` 与 `mod_revision` 有意义
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    /// 是否为首次创建（而非更新）
    pub fn is_create(&self) -> bool {
        self.kind == EventKind::Put && self.kv.create_revision == self.kv.mod_revision
    }
}

/// 一批 watch 事件
#[derive(Debug, Clone, Default)]
pub struct WatchResponse {
    pub events: Vec<WatchEvent>,
    pub revision: Revision,
    /// 非 0 表示请求的起始 revision 已被压缩，watch 已被服务端取消
    pub compact_revision: Revision,
    pub canceled: bool,
}

pub type WatchStream = BoxStream<'static, Result<WatchResponse>>;

/// 续约响应流，元素为续约后的剩余 TTL（秒），`<= 0` 表示租约已失效
pub type KeepAliveStream = BoxStream<'static, Result<i64>>;

/// 比较目标（均为等值比较）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
}

/// 事务比较条件
///
/// `prefix` 为 true 时条件作用于前缀下的所有键；前缀下没有键时，
/// 与一个全零记录比较（与 etcd 的范围比较语义一致）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub prefix: bool,
    pub target: CompareTarget,
}

impl Compare {
    /// 键不存在
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: false,
            target: CompareTarget::CreateRevision(0),
        }
    }

    /// 前缀下没有任何键
    pub fn prefix_absent(prefix: impl Into<String>) -> Self {
        Self {
            key: prefix.into(),
            prefix: true,
            target: CompareTarget::CreateRevision(0),
        }
    }

    pub fn mod_revision(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            prefix: false,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, version: i64) -> Self {
        Self {
            key: key.into(),
            prefix: false,
            target: CompareTarget::Version(version),
        }
    }
}

/// 事务操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
        prefix: bool,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: key.into(),
            prefix: false,
        }
    }

    pub fn delete_prefix(prefix: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: prefix.into(),
            prefix: true,
        }
    }
}

/// 比较-执行事务
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    #[must_use]
    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    #[must_use]
    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: Revision,
}

/// 把任意名称编码为不含 '/' 的单个路径段（`%` → `%25`，`/` → `%2F`）
///
/// 编码是单射的，编码后的段作为前缀时不会覆盖其他名称。
pub(crate) fn escape_segment(name: &str) -> String {
    name.replace('%', "%25").replace('/', "%2F")
}

/// 协调逻辑依赖的存储接口
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResponse>;

    /// 写入键值，返回写入后的 revision
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision>;

    /// 删除键（或前缀），返回删除的数量
    async fn delete(&self, key: &str, prefix: bool) -> Result<i64>;

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// 启动续约，返回的流在租约失效或连接中断时结束
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// 撤销租约并删除其绑定的全部键；租约不存在时返回 `NotFound`
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// 查询租约剩余 TTL（秒）；租约不存在或已过期时返回 `NotFound`
    async fn time_to_live(&self, lease: LeaseId) -> Result<i64>;

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// 轻量级健康探测
    async fn status(&self) -> Result<()>;

    /// 便捷方法：读取单个键
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self.range(key, RangeOptions::default()).await?;
        Ok(resp.kvs.into_iter().next())
    }
}
