//! 日志初始化
//!
//! 标准输出承载线上协议，日志一律写到标准错误。

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::env::{core::LogLevel, EnvVar};
use crate::error::{BrokerError, BrokerResult};

const DEFAULT_LEVEL: &str = "info";

/// 确定日志过滤规则
///
/// 优先级：显式级别 > `XTRANSLATE_LOG_LEVEL` > `RUST_LOG` > `info`
pub fn resolve_filter(explicit: Option<&str>) -> BrokerResult<EnvFilter> {
    let invalid = |e: crate::env::EnvError| BrokerError::ConfigError(e.to_string());

    let level = match explicit {
        Some(level) => Some(LogLevel::parse(level).map_err(invalid)?),
        None => LogLevel::get_set().transpose().map_err(invalid)?,
    };

    Ok(match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL)),
    })
}

/// 安装全局日志订阅者
pub fn init(explicit: Option<&str>) -> BrokerResult<()> {
    let filter = resolve_filter(explicit)?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| BrokerError::InternalError(format!("初始化日志失败: {}", e)))
}
