//! 服务实例定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoordError, Result};

/// 实例健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// 维护中，不参与发现
    Maintenance,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(HealthStatus::Unknown),
            "healthy" => Ok(HealthStatus::Healthy),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "maintenance" => Ok(HealthStatus::Maintenance),
            other => Err(CoordError::validation(format!(
                "unknown health status: {}",
                other
            ))),
        }
    }
}

/// 服务实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// 服务名（如 "api", "message-orchestrator"）
    pub service_name: String,

    /// 实例 ID（服务内唯一）
    pub instance_id: String,

    /// 服务地址，`host:port` 或完整 URI
    pub address: String,

    /// 自定义元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub health: HealthStatus,

    /// 权重（用于加权负载均衡）
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub version: Option<String>,

    pub registered_at: DateTime<Utc>,

    pub last_heartbeat: DateTime<Utc>,
}

fn default_weight() -> u32 {
    100
}

impl ServiceInstance {
    /// 创建新的服务实例，默认健康、权重 100
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            metadata: HashMap::new(),
            health: HealthStatus::Healthy,
            weight: default_weight(),
            version: None,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 设置权重
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// 设置健康状态
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    /// 转换为 gRPC URI
    pub fn to_grpc_uri(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }

    /// 检查是否匹配元数据过滤器
    pub fn matches_metadata(&self, filters: &HashMap<String, String>) -> bool {
        filters
            .iter()
            .all(|(key, value)| self.metadata.get(key).is_some_and(|v| v == value))
    }

    /// 检查是否匹配版本
    pub fn matches_version(&self, version: Option<&str>) -> bool {
        match (version, &self.version) {
            (None, _) => true,
            (Some(v), Some(inst_v)) => v == inst_v,
            (Some(_), None) => false,
        }
    }

    /// 注册前的必填字段校验
    pub fn validate(&self) -> Result<()> {
        validate_service_name(&self.service_name)?;
        if self.instance_id.is_empty() || self.instance_id.contains('/') {
            return Err(CoordError::validation(
                "instance_id must be non-empty and must not contain '/'",
            ));
        }
        if self.address.trim().is_empty() {
            return Err(CoordError::validation("instance address cannot be empty"));
        }
        Ok(())
    }
}

pub(crate) fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoordError::validation("service name cannot be empty"));
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err(CoordError::validation(
            "service name must not start or end with '/'",
        ));
    }
    Ok(())
}
