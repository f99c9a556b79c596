//! 错误类型转换实现
//!
//! 把 etcd 客户端、序列化与 IO 错误归一化为 `CoordError`

use super::CoordError;
use std::io;

impl From<etcd_client::Error> for CoordError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::GRpcStatus(status) => CoordError::from(status),
            etcd_client::Error::TransportError(e) => CoordError::connection(e.to_string()),
            etcd_client::Error::IoError(e) => CoordError::connection(e.to_string()),
            etcd_client::Error::LeaseKeepAliveError(msg) => CoordError::connection(msg),
            etcd_client::Error::WatchError(msg) => CoordError::connection(msg),
            etcd_client::Error::InvalidArgs(msg) => CoordError::validation(msg),
            other => CoordError::store(other.to_string()),
        }
    }
}

impl From<tonic::Status> for CoordError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();

        // 根据 gRPC 状态码映射到协调错误
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::Aborted | tonic::Code::ResourceExhausted => {
                CoordError::connection(message)
            }
            tonic::Code::DeadlineExceeded | tonic::Code::Cancelled => CoordError::timeout(message),
            tonic::Code::NotFound => {
                if message.contains("lease") {
                    CoordError::NotFound {
                        code: super::ErrorCode::LeaseNotFound,
                        reason: message,
                    }
                } else {
                    CoordError::NotFound {
                        code: super::ErrorCode::KeyNotFound,
                        reason: message,
                    }
                }
            }
            tonic::Code::InvalidArgument | tonic::Code::OutOfRange => {
                CoordError::validation(message)
            }
            _ => CoordError::store(message),
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::serialization(format!("JSON 序列化错误: {}", err))
    }
}

impl From<toml::de::Error> for CoordError {
    fn from(err: toml::de::Error) -> Self {
        CoordError::configuration(format!("TOML 解析错误: {}", err))
    }
}

impl From<io::Error> for CoordError {
    fn from(err: io::Error) -> Self {
        CoordError::configuration(format!("IO 错误: {}", err))
    }
}
