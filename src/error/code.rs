//! 错误代码定义
//!
//! 按类别划分数字区间，便于日志检索和跨服务对齐

use serde::{Deserialize, Serialize};
use std::fmt;

/// 协调服务错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    ConnectionTimeout = 1001,
    ConnectionClosed = 1002,

    // ============================================================
    // 存储错误 (2000-2999)
    // ============================================================
    KeyNotFound = 2000,
    LeaseNotFound = 2001,
    StoreError = 2002,

    // ============================================================
    // 并发冲突 (3000-3999)
    // ============================================================
    LockHeld = 3000,
    VersionConflict = 3001,

    // ============================================================
    // 系统错误 (6000-6999)
    // ============================================================
    ServiceUnavailable = 6001,
    ConfigurationError = 6003,
    CoordinatorClosed = 6005,

    // ============================================================
    // 序列化错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InvalidParameter = 9001,
    OperationTimeout = 9004,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 从数字值创建错误代码
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1000 => Some(ErrorCode::ConnectionFailed),
            1001 => Some(ErrorCode::ConnectionTimeout),
            1002 => Some(ErrorCode::ConnectionClosed),
            2000 => Some(ErrorCode::KeyNotFound),
            2001 => Some(ErrorCode::LeaseNotFound),
            2002 => Some(ErrorCode::StoreError),
            3000 => Some(ErrorCode::LockHeld),
            3001 => Some(ErrorCode::VersionConflict),
            6001 => Some(ErrorCode::ServiceUnavailable),
            6003 => Some(ErrorCode::ConfigurationError),
            6005 => Some(ErrorCode::CoordinatorClosed),
            8000 => Some(ErrorCode::SerializationError),
            9001 => Some(ErrorCode::InvalidParameter),
            9004 => Some(ErrorCode::OperationTimeout),
            _ => None,
        }
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::KeyNotFound => "KEY_NOT_FOUND",
            ErrorCode::LeaseNotFound => "LEASE_NOT_FOUND",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::LockHeld => "LOCK_HELD",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::CoordinatorClosed => "COORDINATOR_CLOSED",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::OperationTimeout => "OPERATION_TIMEOUT",
        }
    }

    /// 获取错误代码的类别（用于错误分类）
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Store,
            3000..=3999 => ErrorCategory::Concurrency,
            6000..=6999 => ErrorCategory::System,
            8000..=8999 => ErrorCategory::Serialization,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionClosed
                | ErrorCode::OperationTimeout
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Store,
    Concurrency,
    System,
    Serialization,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Store => write!(f, "STORE"),
            ErrorCategory::Concurrency => write!(f, "CONCURRENCY"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_and_category() {
        for code in [
            ErrorCode::ConnectionFailed,
            ErrorCode::LeaseNotFound,
            ErrorCode::VersionConflict,
            ErrorCode::ServiceUnavailable,
            ErrorCode::OperationTimeout,
        ] {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), Some(code));
        }
        assert_eq!(ErrorCode::LockHeld.category(), ErrorCategory::Concurrency);
        assert_eq!(ErrorCode::KeyNotFound.category(), ErrorCategory::Store);
        assert_eq!(ErrorCode::from_u32(4242), None);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::ConnectionFailed.is_retryable());
        assert!(!ErrorCode::VersionConflict.is_retryable());
        assert!(!ErrorCode::KeyNotFound.is_retryable());
    }
}
