//! Flare Coordination Library
//!
//! 基于 etcd 的分布式协调服务：带租约的分布式锁、服务注册与发现、带版本的配置中心。
//! 所有能力通过 [`Coordinator`] 组合，共享同一个存储连接与重试策略。

pub mod config;
pub mod config_center;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod lock;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod store;
pub mod task;
pub mod watch;

// Re-exports
pub use config::{
    ConfigCenterConfig, CoordinatorConfig, LockConfig, LogConfig, LogFormat, RegistryConfig,
    RetryConfig, WatchConfig,
};
pub use config_center::{ChangeType, ConfigCenter, ConfigChange, ConfigEntry, ConfigMeta, ConfigVersion};
pub use coordinator::{Coordinator, ModuleConfig, ModuleCoordinator, ModuleLocks, ModuleRegistry};
pub use error::{CoordError, ErrorCategory, ErrorCode, Result};
pub use lease::{LeaseManager, Session};
pub use lock::{Lock, LockKind, LockRecord, LockService, ReentrantLock};
pub use registry::{
    AddressProvider, HealthStatus, LoadBalanceStrategy, ResolvedAddress, ServiceConnection,
    ServiceInstance, ServiceRegistry, ServiceResolver,
};
pub use retry::{ExponentialBackoffPolicy, RetryPolicy};
pub use store::{KvStore, MemoryStore};
pub use watch::{OverflowPolicy, Subscription};
