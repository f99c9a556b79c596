//! 协调服务统一错误类型

use super::code::{ErrorCategory, ErrorCode};
use thiserror::Error;

/// 协调服务统一错误类型
///
/// `Connection` / `Timeout` 属于瞬时错误，由存储适配层在重试预算内自动重试；
/// 预算耗尽后以 `ServiceUnavailable` 暴露给调用方。`NotFound` 与 `Conflict`
/// 具有业务含义，永远不会被自动重试。
#[derive(Error, Debug, Clone)]
pub enum CoordError {
    /// 瞬时连接错误（可重试）
    #[error("连接错误: {0}")]
    Connection(String),

    /// 超时或调用方截止时间到达
    #[error("操作超时: {0}")]
    Timeout(String),

    /// 键或租约不存在
    #[error("未找到 [{code}]: {reason}", code = .code.as_str())]
    NotFound { code: ErrorCode, reason: String },

    /// 锁已被持有或版本不匹配
    #[error("冲突 [{code}]: {reason}", code = .code.as_str())]
    Conflict { code: ErrorCode, reason: String },

    /// 输入校验失败（在任何存储 I/O 之前抛出）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 重试耗尽后存储仍不可达
    #[error("服务不可用: {0}")]
    ServiceUnavailable(String),

    /// 序列化 / 反序列化失败
    #[error("序列化错误: {0}")]
    Serialization(String),

    /// 配置非法
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 协调器已关闭
    #[error("协调器已关闭")]
    Closed,

    /// 其他不可重试的存储错误
    #[error("存储错误: {0}")]
    Store(String),
}

impl CoordError {
    pub fn connection(reason: impl Into<String>) -> Self {
        CoordError::Connection(reason.into())
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        CoordError::Timeout(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        CoordError::Validation(reason.into())
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        CoordError::ServiceUnavailable(reason.into())
    }

    pub fn store(reason: impl Into<String>) -> Self {
        CoordError::Store(reason.into())
    }

    pub fn serialization(reason: impl Into<String>) -> Self {
        CoordError::Serialization(reason.into())
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        CoordError::Configuration(reason.into())
    }

    // ============================================================
    // 便捷方法：不存在 / 冲突
    // ============================================================

    /// 创建键不存在错误
    pub fn key_not_found(key: impl AsRef<str>) -> Self {
        CoordError::NotFound {
            code: ErrorCode::KeyNotFound,
            reason: format!("key not found: {}", key.as_ref()),
        }
    }

    /// 创建租约不存在错误
    pub fn lease_not_found(lease_id: i64) -> Self {
        CoordError::NotFound {
            code: ErrorCode::LeaseNotFound,
            reason: format!("lease {:x} not found or expired", lease_id),
        }
    }

    /// 创建锁已被持有错误
    pub fn lock_held(key: impl AsRef<str>) -> Self {
        CoordError::Conflict {
            code: ErrorCode::LockHeld,
            reason: format!("lock already held: {}", key.as_ref()),
        }
    }

    /// 创建版本冲突错误
    pub fn version_conflict(key: impl AsRef<str>, expected: i64, actual: i64) -> Self {
        CoordError::Conflict {
            code: ErrorCode::VersionConflict,
            reason: format!(
                "version mismatch for {}: expected {}, actual {}",
                key.as_ref(),
                expected,
                actual
            ),
        }
    }

    // ============================================================
    // 信息获取方法
    // ============================================================

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordError::Connection(_) => ErrorCode::ConnectionFailed,
            CoordError::Timeout(_) => ErrorCode::OperationTimeout,
            CoordError::NotFound { code, .. } => *code,
            CoordError::Conflict { code, .. } => *code,
            CoordError::Validation(_) => ErrorCode::InvalidParameter,
            CoordError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            CoordError::Serialization(_) => ErrorCode::SerializationError,
            CoordError::Configuration(_) => ErrorCode::ConfigurationError,
            CoordError::Closed => ErrorCode::CoordinatorClosed,
            CoordError::Store(_) => ErrorCode::StoreError,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CoordError::Conflict { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordError::Timeout(_))
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_codes() {
        assert_eq!(CoordError::lock_held("a").code(), ErrorCode::LockHeld);
        assert_eq!(
            CoordError::version_conflict("a", 1, 2).code(),
            ErrorCode::VersionConflict
        );
        assert_eq!(CoordError::lease_not_found(7).code(), ErrorCode::LeaseNotFound);
        assert!(CoordError::connection("reset").is_retryable());
        assert!(CoordError::timeout("deadline").is_retryable());
        assert!(!CoordError::lock_held("a").is_retryable());
        assert!(!CoordError::key_not_found("a").is_retryable());
        assert!(!CoordError::unavailable("down").is_retryable());
    }

    #[test]
    fn test_display_contains_reason() {
        let err = CoordError::version_conflict("feature.flag", 1, 2);
        let text = err.to_string();
        assert!(text.contains("VERSION_CONFLICT"));
        assert!(text.contains("feature.flag"));
    }
}
