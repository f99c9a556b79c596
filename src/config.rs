use crate::error::{CoordError, Result};
use crate::watch::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 协调器配置
///
/// 所有字段都带默认值，TOML 中只需写出需要覆盖的部分。
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// etcd 服务器地址列表
    pub endpoints: Vec<String>,
    /// 连接超时（毫秒）
    pub dial_timeout_ms: u64,
    /// 单次请求超时（毫秒）
    pub request_timeout_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 所有键的公共前缀，例如 "/flare"
    pub key_prefix: String,
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub registry: RegistryConfig,
    pub config_center: ConfigCenterConfig,
    pub watch: WatchConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 总尝试次数（包含首次调用）
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 抖动比例，取值 [0, 1]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_secs: u64,
    /// 阻塞获取的默认等待上限（毫秒）
    pub acquire_timeout_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub enable_reentrant: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub enable_health_check: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigCenterConfig {
    pub enable_versioning: bool,
    pub max_version_history: usize,
    pub max_value_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// 每个订阅的通道容量
    pub buffer_size: usize,
    /// 通道满时的处理策略
    pub overflow: OverflowPolicy,
    /// watch 断开后的最大重连次数
    pub reconnect_attempts: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout_ms: 3_000,
            request_timeout_ms: 5_000,
            username: None,
            password: None,
            key_prefix: String::new(),
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
            registry: RegistryConfig::default(),
            config_center: ConfigCenterConfig::default(),
            watch: WatchConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            acquire_timeout_ms: 30_000,
            retry_initial_ms: 50,
            retry_max_ms: 1_000,
            enable_reentrant: true,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            heartbeat_interval_secs: 10,
            enable_health_check: true,
        }
    }
}

impl Default for ConfigCenterConfig {
    fn default() -> Self {
        Self {
            enable_versioning: true,
            max_version_history: 100,
            max_value_bytes: 1024 * 1024,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            overflow: OverflowPolicy::Block,
            reconnect_attempts: 5,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl CoordinatorConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 本地开发配置：短 TTL，调试日志
    pub fn development() -> Self {
        let mut config = Self::default();
        config.registry.ttl_secs = 10;
        config.registry.heartbeat_interval_secs = 3;
        config.lock.default_ttl_secs = 10;
        config.config_center.max_version_history = 20;
        config.log.level = "debug".to_string();
        config
    }

    /// 生产配置：更长的超时与更多重试，JSON 日志
    pub fn production(endpoints: Vec<String>) -> Self {
        let mut config = Self::default();
        config.endpoints = endpoints;
        config.dial_timeout_ms = 5_000;
        config.request_timeout_ms = 10_000;
        config.retry.max_attempts = 5;
        config.retry.max_delay_ms = 5_000;
        config.registry.ttl_secs = 60;
        config.registry.heartbeat_interval_secs = 20;
        config.config_center.max_version_history = 200;
        config.watch.buffer_size = 1_000;
        config.log.format = LogFormat::Json;
        config
    }

    /// 测试配置：极短的重试与超时
    pub fn test() -> Self {
        let mut config = Self::default();
        config.dial_timeout_ms = 1_000;
        config.request_timeout_ms = 2_000;
        config.retry.max_attempts = 2;
        config.retry.initial_delay_ms = 10;
        config.retry.max_delay_ms = 50;
        config.lock.acquire_timeout_ms = 2_000;
        config.lock.retry_initial_ms = 10;
        config.lock.retry_max_ms = 50;
        config.registry.ttl_secs = 5;
        config.registry.heartbeat_interval_secs = 1;
        config.config_center.max_version_history = 10;
        config.watch.buffer_size = 16;
        config.watch.reconnect_attempts = 2;
        config.log.level = "debug".to_string();
        config
    }

    #[must_use]
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 校验配置，失败时返回 `CoordError::Configuration`
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(CoordError::configuration("endpoints cannot be empty"));
        }
        if self.dial_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(CoordError::configuration("timeouts must be positive"));
        }
        if self.key_prefix.ends_with('/') {
            return Err(CoordError::configuration(
                "key_prefix must not end with '/'",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(CoordError::configuration("retry.max_attempts must be >= 1"));
        }
        if retry.initial_delay_ms == 0 || retry.initial_delay_ms > retry.max_delay_ms {
            return Err(CoordError::configuration(
                "retry delays must satisfy 0 < initial_delay_ms <= max_delay_ms",
            ));
        }
        if retry.multiplier <= 1.0 {
            return Err(CoordError::configuration(
                "retry.multiplier must be greater than 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(CoordError::configuration(
                "retry.jitter must be within [0, 1]",
            ));
        }

        if self.lock.default_ttl_secs == 0 || self.lock.acquire_timeout_ms == 0 {
            return Err(CoordError::configuration(
                "lock ttl and acquire timeout must be positive",
            ));
        }
        if self.lock.retry_initial_ms == 0 || self.lock.retry_initial_ms > self.lock.retry_max_ms {
            return Err(CoordError::configuration(
                "lock retry delays must satisfy 0 < retry_initial_ms <= retry_max_ms",
            ));
        }

        if self.registry.ttl_secs == 0 {
            return Err(CoordError::configuration("registry.ttl_secs must be positive"));
        }
        if self.registry.enable_health_check && self.registry.heartbeat_interval_secs == 0 {
            return Err(CoordError::configuration(
                "registry.heartbeat_interval_secs must be positive",
            ));
        }

        if self.config_center.enable_versioning && self.config_center.max_version_history == 0 {
            return Err(CoordError::configuration(
                "config_center.max_version_history must be positive when versioning is enabled",
            ));
        }
        if self.config_center.max_value_bytes == 0 {
            return Err(CoordError::configuration(
                "config_center.max_value_bytes must be positive",
            ));
        }

        if self.watch.buffer_size == 0 {
            return Err(CoordError::configuration("watch.buffer_size must be positive"));
        }

        Ok(())
    }
}
