//! 跨上下文消息总线
//!
//! - `message`: 消息、回复信封与发送方上下文
//! - `broker`: 处理器注册与分发循环
//! - `client`: 各上下文使用的请求/回复客户端
//! - `lifecycle`: 安装钩子

pub mod broker;
pub mod client;
pub mod lifecycle;
pub mod message;

pub use broker::{Broker, BrokerHandle, Handler, Responder};
pub use client::BusClient;
pub use lifecycle::{InstallHook, InstallReason};
pub use message::{
    ContextKind, Message, MessageId, MessageType, ReplyEnvelope, Request, SenderContext,
};
