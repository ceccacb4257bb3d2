//! 统一错误处理
//!
//! 提供结构化错误类型、跨上下文传递的错误描述符以及错误处理助手函数

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::message::MessageType;

/// 后台代理错误类型
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 输入验证错误
    #[error("输入无效: {0}")]
    InvalidInput(String),

    /// 存储读写错误
    #[error("存储错误: {0}")]
    StorageError(String),

    /// 存储尚未完成初始加载
    #[error("存储 \"{0}\" 尚未就绪")]
    StorageNotReady(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 解析错误
    #[error("解析错误: {0}")]
    ParseError(String),

    /// 消息类型没有注册处理器
    #[error("消息类型 {0} 没有注册处理器")]
    NoHandler(MessageType),

    /// 处理器返回的错误（来自远端上下文）
    #[error("处理器错误: {0}")]
    HandlerError(ErrorDescriptor),

    /// 对端上下文已断开
    #[error("连接已断开: {0}")]
    Disconnected(String),

    /// 超时错误
    #[error("操作超时: {0}")]
    TimeoutError(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    InternalError(String),
}

impl BrokerError {
    /// 检查错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::NetworkError(_) => true,
            BrokerError::TimeoutError(_) => true,
            BrokerError::StorageError(_) => true,
            BrokerError::StorageNotReady(_) => true,
            BrokerError::Disconnected(_) => false,
            BrokerError::ConfigError(_) => false,
            BrokerError::InvalidInput(_) => false,
            BrokerError::SerializationError(_) => false,
            BrokerError::ParseError(_) => false,
            BrokerError::NoHandler(_) => false,
            BrokerError::HandlerError(_) => false,
            BrokerError::InternalError(_) => false,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BrokerError::ConfigError(_) => ErrorSeverity::Critical,
            BrokerError::NetworkError(_) => ErrorSeverity::Warning,
            BrokerError::InvalidInput(_) => ErrorSeverity::Info,
            BrokerError::StorageError(_) => ErrorSeverity::Error,
            BrokerError::StorageNotReady(_) => ErrorSeverity::Warning,
            BrokerError::SerializationError(_) => ErrorSeverity::Error,
            BrokerError::ParseError(_) => ErrorSeverity::Error,
            BrokerError::NoHandler(_) => ErrorSeverity::Error,
            BrokerError::HandlerError(_) => ErrorSeverity::Error,
            BrokerError::Disconnected(_) => ErrorSeverity::Warning,
            BrokerError::TimeoutError(_) => ErrorSeverity::Warning,
            BrokerError::InternalError(_) => ErrorSeverity::Critical,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::ConfigError(_) => ErrorCategory::Configuration,
            BrokerError::NetworkError(_) => ErrorCategory::Network,
            BrokerError::InvalidInput(_) => ErrorCategory::Input,
            BrokerError::StorageError(_) => ErrorCategory::Storage,
            BrokerError::StorageNotReady(_) => ErrorCategory::Storage,
            BrokerError::SerializationError(_) => ErrorCategory::Serialization,
            BrokerError::ParseError(_) => ErrorCategory::Parsing,
            BrokerError::NoHandler(_) => ErrorCategory::Routing,
            BrokerError::HandlerError(_) => ErrorCategory::Handler,
            BrokerError::Disconnected(_) => ErrorCategory::Transport,
            BrokerError::TimeoutError(_) => ErrorCategory::Timeout,
            BrokerError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// 创建带上下文的错误
    pub fn with_context<T: fmt::Display>(mut self, context: T) -> Self {
        match &mut self {
            BrokerError::ConfigError(msg)
            | BrokerError::NetworkError(msg)
            | BrokerError::InvalidInput(msg)
            | BrokerError::StorageError(msg)
            | BrokerError::SerializationError(msg)
            | BrokerError::ParseError(msg)
            | BrokerError::Disconnected(msg)
            | BrokerError::TimeoutError(msg)
            | BrokerError::InternalError(msg) => {
                *msg = format!("{} (上下文: {})", msg, context);
            }
            // 结构化变体保持原样
            BrokerError::StorageNotReady(_)
            | BrokerError::NoHandler(_)
            | BrokerError::HandlerError(_) => {}
        }

        self
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Input,
    Storage,
    Serialization,
    Parsing,
    Routing,
    Handler,
    Transport,
    Timeout,
    Internal,
}

impl ErrorCategory {
    /// 错误类别的稳定名称，用于错误描述符的 `kind` 字段
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Input => "input",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::Routing => "routing",
            ErrorCategory::Handler => "handler",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// 可序列化的错误描述符
///
/// 这是唯一会跨越上下文边界的错误形式：处理器内部的任何错误都会在总线边界被转换成它，
/// 并通过与成功结果相同的回复通道送回调用方。可重试的错误带有 `{"retryable": true}` 详情。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            details: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "[{}] {}", kind, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<&BrokerError> for ErrorDescriptor {
    fn from(error: &BrokerError) -> Self {
        match error {
            // 远端描述符原样透传，避免层层包裹
            BrokerError::HandlerError(descriptor) => descriptor.clone(),
            other => {
                let descriptor =
                    ErrorDescriptor::new(other.to_string()).with_kind(other.category().as_str());
                if other.is_retryable() {
                    descriptor.with_details(serde_json::json!({ "retryable": true }))
                } else {
                    descriptor
                }
            }
        }
    }
}

impl From<BrokerError> for ErrorDescriptor {
    fn from(error: BrokerError) -> Self {
        ErrorDescriptor::from(&error)
    }
}

/// 标准错误转换
impl From<std::io::Error> for BrokerError {
    fn from(error: std::io::Error) -> Self {
        BrokerError::StorageError(format!("IO错误: {}", error))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(error: serde_json::Error) -> Self {
        BrokerError::SerializationError(format!("JSON序列化错误: {}", error))
    }
}

impl From<toml::de::Error> for BrokerError {
    fn from(error: toml::de::Error) -> Self {
        BrokerError::ParseError(format!("TOML解析错误: {}", error))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            BrokerError::TimeoutError(format!("HTTP请求超时: {}", error))
        } else {
            BrokerError::NetworkError(error.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for BrokerError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        BrokerError::TimeoutError(format!("异步操作超时: {}", error))
    }
}

/// 错误结果类型别名
pub type BrokerResult<T> = Result<T, BrokerError>;

/// 错误处理助手函数
pub mod helpers {
    use super::*;

    /// 按严重程度记录错误，供吞掉错误的路径使用
    pub fn log_error(error: &BrokerError, context: &str) {
        match error.severity() {
            ErrorSeverity::Info => tracing::info!("{}: {}", context, error),
            ErrorSeverity::Warning => tracing::warn!("{}: {}", context, error),
            ErrorSeverity::Error => tracing::error!("{}: {}", context, error),
            ErrorSeverity::Critical => tracing::error!("{} (严重): {}", context, error),
        }
    }

    /// 创建配置错误
    pub fn config_error<T: fmt::Display>(msg: T) -> BrokerError {
        BrokerError::ConfigError(msg.to_string())
    }

    /// 创建存储错误
    pub fn storage_error<T: fmt::Display>(msg: T) -> BrokerError {
        BrokerError::StorageError(msg.to_string())
    }

    /// 创建输入验证错误
    pub fn validation_error<T: fmt::Display>(msg: T) -> BrokerError {
        BrokerError::InvalidInput(msg.to_string())
    }

    /// 创建内部错误
    pub fn internal_error<T: fmt::Display>(msg: T) -> BrokerError {
        BrokerError::InternalError(msg.to_string())
    }
}
