//! 协调服务错误处理模块
//!
//! 提供统一的错误分类、错误代码与外部错误转换

pub mod code;
pub mod conversions;
pub mod coord_error;

// 重新导出公共类型
pub use code::{ErrorCategory, ErrorCode};
pub use coord_error::{CoordError, Result};

/// 基础设施层默认使用的结果类型
pub type InfraResult<T> = anyhow::Result<T>;
