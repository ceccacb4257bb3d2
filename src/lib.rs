//! # XTranslate 后台代理
//!
//! 浏览器扩展的特权后台进程：页面上下文彼此隔离、不能直接跨域请求，
//! 它们通过消息总线把网络请求、语音朗读和翻译历史查询交给后台完成。
//!
//! ## 模块组织
//!
//! - `bus` - 跨上下文消息总线（请求/回复关联、即发即弃、安装钩子）
//! - `handlers` - 代理、历史、语音处理器
//! - `history` - 内容寻址的翻译缓存
//! - `storage` - 持久化后端与类型化存储助手
//! - `background` - 后台上下文装配
//! - `config` / `env` - 配置文件与环境变量
//! - `error` - 错误类型
//! - `logging` - 日志初始化（可选）

pub mod background;
pub mod bus;
pub mod config;
pub mod env;
pub mod error;
pub mod handlers;
pub mod history;
#[cfg(feature = "cli")]
pub mod logging;
pub mod storage;

// Re-export commonly used items for convenience
pub use background::{Background, BackgroundDeps};
pub use bus::{Broker, BrokerHandle, BusClient, ContextKind, Message, MessageType, Request};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult, ErrorDescriptor};
pub use history::{TranslatePayload, TranslationCache, TranslationResult};
pub use storage::{FileBackend, MemoryBackend, StorageArea, StorageBackend, StorageHelper};
