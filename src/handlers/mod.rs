//! 后台消息处理器
//!
//! - `proxy`: `proxy-request`
//! - `history`: `save-to-history`、`get-from-history`
//! - `speech`: `tts-play`、`tts-stop`

pub mod history;
pub mod proxy;
pub mod speech;

pub use history::{GetFromHistoryHandler, SaveToHistoryHandler};
pub use proxy::{ProxyHandler, ProxyRequestPayload, ProxyResponse, ProxyResponseType, RequestInit};
pub use speech::{
    LoggingSpeechEngine, SpeechEngine, SpeechOptions, TtsPayload, TtsPlayHandler, TtsStopHandler,
};

use crate::bus::{MessageType, Request};
use crate::error::BrokerError;

/// 处理器收到了不属于它的消息（注册错误）
pub(crate) fn unexpected_request(expected: MessageType, actual: &Request) -> BrokerError {
    BrokerError::InternalError(format!(
        "{} 处理器收到了 {} 消息",
        expected,
        actual.message_type()
    ))
}
