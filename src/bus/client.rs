//! 总线客户端
//!
//! 每个上下文持有一个 `BusClient`。请求经代理收件箱投递，回复通过客户端自己的回复通道返回，
//! 再由关联任务按消息 ID 分发给等待者，所以并发请求可以按任意顺序完成。

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::broker::{Inbound, Responder};
use super::message::{Message, MessageId, ReplyEnvelope, Request, SenderContext};
use crate::error::{helpers, BrokerError, BrokerResult};
use crate::handlers::proxy::{ProxyRequestPayload, ProxyResponse};
use crate::handlers::speech::TtsPayload;
use crate::history::{SaveToHistoryPayload, TranslatePayload, TranslationResult};

type PendingTable = DashMap<MessageId, oneshot::Sender<ReplyEnvelope>>;

/// 总线客户端
#[derive(Clone)]
pub struct BusClient {
    context: SenderContext,
    inbox: mpsc::UnboundedSender<Inbound>,
    replies: mpsc::UnboundedSender<ReplyEnvelope>,
    pending: Arc<PendingTable>,
    timeout: Option<Duration>,
}

impl BusClient {
    pub(crate) fn new(
        context: SenderContext,
        inbox: mpsc::UnboundedSender<Inbound>,
        timeout: Option<Duration>,
    ) -> Self {
        let (replies, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingTable::new());
        tokio::spawn(correlate(receiver, Arc::clone(&pending)));

        Self {
            context,
            inbox,
            replies,
            pending,
            timeout,
        }
    }

    pub fn context(&self) -> &SenderContext {
        &self.context
    }

    /// 仍在等待回复的请求数
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// 发送请求并等待结果
    ///
    /// 处理器回复数据时返回 `Some`，未回复时返回 `None`，回复错误时返回 `Err`。
    pub async fn send(&self, request: Request) -> BrokerResult<Option<Value>> {
        self.request(Message::new(request)).await?.into_result()
    }

    /// 发送完整消息并返回原始回复信封
    ///
    /// 消息 ID 由调用方决定，同一客户端上不能有两个相同 ID 的请求同时等待。
    pub async fn request(&self, message: Message) -> BrokerResult<ReplyEnvelope> {
        let id = message.id.clone();
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(BrokerError::InvalidInput(format!(
                    "消息 ID {} 已有请求在等待回复",
                    id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let responder = Responder::new(id.clone(), Some(self.replies.clone()));
        let inbound = Inbound {
            message,
            sender: self.context.clone(),
            responder,
        };
        if self.inbox.send(inbound).is_err() {
            return Err(BrokerError::Disconnected("后台上下文不可达".to_string()));
        }

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|elapsed| {
                warn!("[BUS] 消息 {} 在 {:?} 内没有收到回复", id, limit);
                BrokerError::from(elapsed).with_context(format!("消息 {}", id))
            })?,
            None => rx.await,
        };

        reply.map_err(|_| BrokerError::Disconnected(format!("消息 {} 的回复通道已关闭", id)))
    }

    /// 即发即弃：不等待、不关心结果，调用本身不会挂起
    pub fn send_fire_and_forget(&self, request: Request) {
        let message = Message::new(request);
        let id = message.id.clone();
        let inbound = Inbound {
            message,
            sender: self.context.clone(),
            responder: Responder::detached(id.clone()),
        };

        if self.inbox.send(inbound).is_err() {
            debug!("[BUS] 后台上下文不可达，丢弃消息 {}", id);
        }
    }

    /// 通过后台代理发起网络请求
    pub async fn proxy_request(&self, payload: ProxyRequestPayload) -> BrokerResult<ProxyResponse> {
        let data = self
            .send(Request::ProxyRequest(payload))
            .await?
            .ok_or_else(|| helpers::internal_error("代理处理器没有返回数据"))?;
        Ok(serde_json::from_value(data)?)
    }

    /// 查询翻译缓存，未命中时返回 `None`
    pub async fn get_from_history(
        &self,
        payload: TranslatePayload,
    ) -> BrokerResult<Option<TranslationResult>> {
        match self.send(Request::GetFromHistory(payload)).await? {
            None | Some(Value::Null) => Ok(None),
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
        }
    }

    /// 保存翻译结果（即发即弃）
    pub fn save_to_history(&self, translation: TranslationResult) {
        self.send_fire_and_forget(Request::SaveToHistory(SaveToHistoryPayload { translation }));
    }

    /// 朗读文本（即发即弃）
    pub fn tts_play(&self, payload: TtsPayload) {
        self.send_fire_and_forget(Request::TtsPlay(payload));
    }

    /// 停止朗读（即发即弃）
    pub fn tts_stop(&self) {
        self.send_fire_and_forget(Request::TtsStop);
    }
}

/// 请求结束（完成、超时或被取消）时移除等待表中的条目
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn correlate(
    mut replies: mpsc::UnboundedReceiver<ReplyEnvelope>,
    pending: Arc<PendingTable>,
) {
    while let Some(envelope) = replies.recv().await {
        match pending.remove(&envelope.message_id) {
            Some((_, waiter)) => {
                // 等待者可能刚好超时
                let _ = waiter.send(envelope);
            }
            None => {
                debug!("[BUS] 丢弃无人等待的回复: {}", envelope.message_id);
            }
        }
    }
}
