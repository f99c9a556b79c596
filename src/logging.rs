//! 日志初始化

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};
use crate::error::InfraResult;

/// 依赖库的默认降噪级别
const NOISY_CRATES: &str = ",h2=warn,tower=warn,hyper=warn,hyper_util=warn";

/// 初始化全局 tracing subscriber
///
/// `RUST_LOG` 存在时优先生效，否则使用 `config.level`。已安装过全局 subscriber 时返回错误，
/// 调用方可以忽略。
pub fn init(config: &LogConfig) -> InfraResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{}{}", config.level, NOISY_CRATES)))
        .map_err(|e| anyhow!("invalid log level {:?}: {}", config.level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match config.format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
