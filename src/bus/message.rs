//! 总线消息定义
//!
//! 消息类型是封闭的枚举，每个变体携带自己的强类型负载。
//! 线上格式：`{ "id": "...", "type": "get-from-history", "payload": { ... } }`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, BrokerResult, ErrorDescriptor};
use crate::handlers::proxy::ProxyRequestPayload;
use crate::handlers::speech::TtsPayload;
use crate::history::{SaveToHistoryPayload, TranslatePayload};

/// 请求关联 ID，只用于把回复与请求对应起来，从不持久化
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// 生成新的唯一 ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 消息类型（路由键）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    ProxyRequest,
    SaveToHistory,
    GetFromHistory,
    TtsPlay,
    TtsStop,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::ProxyRequest,
        MessageType::SaveToHistory,
        MessageType::GetFromHistory,
        MessageType::TtsPlay,
        MessageType::TtsStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ProxyRequest => "proxy-request",
            MessageType::SaveToHistory => "save-to-history",
            MessageType::GetFromHistory => "get-from-history",
            MessageType::TtsPlay => "tts-play",
            MessageType::TtsStop => "tts-stop",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求负载，按消息类型区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Request {
    ProxyRequest(ProxyRequestPayload),
    SaveToHistory(SaveToHistoryPayload),
    GetFromHistory(TranslatePayload),
    TtsPlay(TtsPayload),
    TtsStop,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::ProxyRequest(_) => MessageType::ProxyRequest,
            Request::SaveToHistory(_) => MessageType::SaveToHistory,
            Request::GetFromHistory(_) => MessageType::GetFromHistory,
            Request::TtsPlay(_) => MessageType::TtsPlay,
            Request::TtsStop => MessageType::TtsStop,
        }
    }
}

/// 总线消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(flatten)]
    pub request: Request,
}

impl Message {
    /// 用新生成的 ID 包装请求
    pub fn new(request: Request) -> Self {
        Self {
            id: MessageId::generate(),
            request,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.request.message_type()
    }
}

/// 回复信封
///
/// 一次成功投递中 `data` 与 `error` 至多一个有意义；处理器没有回复时两者都为空。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl ReplyEnvelope {
    pub fn empty(message_id: MessageId) -> Self {
        Self {
            message_id,
            data: None,
            error: None,
        }
    }

    pub fn success(message_id: MessageId, data: Option<Value>) -> Self {
        Self {
            message_id,
            data,
            error: None,
        }
    }

    pub fn failure(message_id: MessageId, error: ErrorDescriptor) -> Self {
        Self {
            message_id,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }

    /// 转换成调用方的结果：`error` 存在时拒绝，否则返回 `data`
    pub fn into_result(self) -> BrokerResult<Option<Value>> {
        match self.error {
            Some(descriptor) if descriptor.kind.as_deref() == Some(TRANSPORT_KIND) => {
                Err(BrokerError::Disconnected(descriptor.message))
            }
            Some(descriptor) => Err(BrokerError::HandlerError(descriptor)),
            None => Ok(self.data),
        }
    }
}

/// 传输层错误在描述符中的 `kind`
pub(crate) const TRANSPORT_KIND: &str = "transport";

/// 上下文类别
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ContextKind {
    /// 拥有特权的后台上下文
    Background,
    /// 扩展自身的页面（选项页、弹出页）
    ExtensionPage,
    /// 注入到网页中的内容脚本
    ContentScript { tab_id: u64 },
    /// 通过标准输入输出连接的本地宿主
    NativeHost,
}

/// 发送方上下文，随每条消息一起交给处理器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderContext {
    pub id: String,
    #[serde(flatten)]
    pub kind: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SenderContext {
    pub fn new(id: impl Into<String>, kind: ContextKind) -> Self {
        Self {
            id: id.into(),
            kind,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}
