//! 翻译历史处理器
//!
//! 保存是即发即弃的：失败只记录日志。查询从不访问网络，存储失败按未命中处理。

use futures::future::BoxFuture;
use tracing::debug;

use super::unexpected_request;
use crate::bus::{Handler, Message, MessageType, Request, Responder, SenderContext};
use crate::error::{helpers, BrokerResult};
use crate::history::TranslationCache;

/// `save-to-history` 处理器
#[derive(Clone)]
pub struct SaveToHistoryHandler {
    cache: TranslationCache,
}

impl SaveToHistoryHandler {
    pub fn new(cache: TranslationCache) -> Self {
        Self { cache }
    }
}

impl Handler for SaveToHistoryHandler {
    fn handle(
        &self,
        message: Message,
        _sender: SenderContext,
        _responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let cache = self.cache.clone();
        Box::pin(async move {
            let payload = match message.request {
                Request::SaveToHistory(payload) => payload,
                other => return Err(unexpected_request(MessageType::SaveToHistory, &other)),
            };

            if let Err(e) = cache.save(&payload.translation).await {
                helpers::log_error(
                    &e,
                    &format!("[HISTORY] 保存翻译到历史失败 (消息 {})", message.id),
                );
            }
            Ok(())
        })
    }
}

/// `get-from-history` 处理器
#[derive(Clone)]
pub struct GetFromHistoryHandler {
    cache: TranslationCache,
}

impl GetFromHistoryHandler {
    pub fn new(cache: TranslationCache) -> Self {
        Self { cache }
    }
}

impl Handler for GetFromHistoryHandler {
    fn handle(
        &self,
        message: Message,
        _sender: SenderContext,
        responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let cache = self.cache.clone();
        Box::pin(async move {
            let payload = match message.request {
                Request::GetFromHistory(payload) => payload,
                other => return Err(unexpected_request(MessageType::GetFromHistory, &other)),
            };

            match cache.lookup(&payload).await {
                Ok(Some(result)) => {
                    debug!("[HISTORY] 命中缓存: {} ({})", payload.text, payload.vendor);
                    responder.reply(&result);
                }
                Ok(None) => {
                    responder.reply_empty();
                }
                Err(e) => {
                    helpers::log_error(
                        &e,
                        &format!("[HISTORY] 查询历史失败，按未命中处理 (消息 {})", message.id),
                    );
                    responder.reply_empty();
                }
            }
            Ok(())
        })
    }
}
