//! 后台代理：处理器注册表与消息分发
//!
//! `Broker` 在进程启动时构建一次，注册完处理器后通过 [`Broker::spawn`] 启动分发循环，
//! 之后只通过 [`BrokerHandle`] 访问。没有任何全局单例。
//!
//! 分发规则：
//! - 只按消息类型路由，每种类型至多一个处理器（重复注册以最后一次为准，并记录警告）
//! - 每条消息在独立任务中处理，完成顺序不保证与提交顺序一致
//! - 处理器返回的错误和 panic 都在这里被捕获并转换成错误描述符，经回复通道送回

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::client::BusClient;
use super::lifecycle::{InstallHook, InstallReason};
use super::message::{
    ContextKind, Message, MessageId, MessageType, ReplyEnvelope, SenderContext, TRANSPORT_KIND,
};
use crate::error::{helpers, BrokerError, BrokerResult, ErrorDescriptor};

pub(crate) type ReplySink = mpsc::UnboundedSender<ReplyEnvelope>;

/// 消息处理器
///
/// 处理器拿到消息、发送方上下文和一个 [`Responder`]。它可以在返回前或返回后的任意时刻回复，
/// 但至多回复一次。返回 `Err` 且尚未回复时，总线会把错误作为回复送回调用方。
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        message: Message,
        sender: SenderContext,
        responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Message, SenderContext, Responder) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = BrokerResult<()>> + Send + 'static,
{
    fn handle(
        &self,
        message: Message,
        sender: SenderContext,
        responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        Box::pin(self(message, sender, responder))
    }
}

/// 单次回复的槽位
///
/// 最后一个 [`Responder`] 被释放时，如果还没有回复：
/// - 消息已经交给处理器 → 发送空信封（处理器选择不回复）
/// - 消息还没送达处理器就被丢弃 → 发送传输错误
struct ReplySlot {
    message_id: MessageId,
    sink: Mutex<Option<ReplySink>>,
    dispatched: AtomicBool,
}

impl ReplySlot {
    fn take_sink(&self) -> Option<ReplySink> {
        match self.sink.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        let sink = match self.sink.get_mut() {
            Ok(sink) => sink.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(sink) = sink else {
            return;
        };

        let envelope = if self.dispatched.load(Ordering::Acquire) {
            ReplyEnvelope::empty(self.message_id.clone())
        } else {
            ReplyEnvelope::failure(
                self.message_id.clone(),
                ErrorDescriptor::new("消息在送达处理器前被丢弃").with_kind(TRANSPORT_KIND),
            )
        };
        // 调用方可能已经放弃等待
        let _ = sink.send(envelope);
    }
}

/// 回复句柄
///
/// 可以克隆并移动到其他任务中以便稍后回复；所有克隆共享同一个槽位，第一次回复之后的调用返回 `false`。
#[derive(Clone)]
pub struct Responder {
    slot: Arc<ReplySlot>,
}

impl Responder {
    pub(crate) fn new(message_id: MessageId, sink: Option<ReplySink>) -> Self {
        Self {
            slot: Arc::new(ReplySlot {
                message_id,
                sink: Mutex::new(sink),
                dispatched: AtomicBool::new(false),
            }),
        }
    }

    /// 不需要回复的消息（即发即弃）
    pub(crate) fn detached(message_id: MessageId) -> Self {
        Self::new(message_id, None)
    }

    pub(crate) fn mark_dispatched(&self) {
        self.slot.dispatched.store(true, Ordering::Release);
    }

    pub fn message_id(&self) -> &MessageId {
        &self.slot.message_id
    }

    /// 调用方是否在等待回复且尚未回复
    pub fn expects_reply(&self) -> bool {
        match self.slot.sink.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// 以序列化后的 `data` 回复；序列化失败时改为回复错误
    pub fn reply<T: Serialize>(&self, data: &T) -> bool {
        match serde_json::to_value(data) {
            Ok(value) => self.reply_value(Some(value)),
            Err(e) => self.reply_error(BrokerError::from(e)),
        }
    }

    /// 以原始 JSON 值回复，`None` 表示空结果
    pub fn reply_value(&self, data: Option<serde_json::Value>) -> bool {
        self.deliver(|id| ReplyEnvelope::success(id, data))
    }

    /// 回复空结果
    pub fn reply_empty(&self) -> bool {
        self.reply_value(None)
    }

    /// 以错误描述符回复
    pub fn reply_error(&self, error: impl Into<ErrorDescriptor>) -> bool {
        let descriptor = error.into();
        self.deliver(|id| ReplyEnvelope::failure(id, descriptor))
    }

    fn deliver(&self, build: impl FnOnce(MessageId) -> ReplyEnvelope) -> bool {
        let Some(sink) = self.slot.take_sink() else {
            return false;
        };

        let envelope = build(self.slot.message_id.clone());
        if sink.send(envelope).is_err() {
            debug!("[BUS] 消息 {} 的调用方已离开，回复被丢弃", self.slot.message_id);
        }
        true
    }
}

/// 投递到代理收件箱的消息
pub(crate) struct Inbound {
    pub(crate) message: Message,
    pub(crate) sender: SenderContext,
    pub(crate) responder: Responder,
}

/// 处理器注册表（启动前）
#[derive(Default)]
pub struct Broker {
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
    install_hook: Option<Arc<dyn InstallHook>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器
    ///
    /// 同一类型重复注册时以最后一次为准，并记录警告；调用方不应依赖这一行为。
    pub fn register_handler<H: Handler>(
        &mut self,
        message_type: MessageType,
        handler: H,
    ) -> &mut Self {
        if self
            .handlers
            .insert(message_type, Arc::new(handler))
            .is_some()
        {
            warn!("[BUS] 消息类型 {} 的处理器被重复注册，以最后一次为准", message_type);
        }
        self
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    pub fn set_install_hook<H: InstallHook>(&mut self, hook: H) -> &mut Self {
        self.install_hook = Some(Arc::new(hook));
        self
    }

    /// 启动分发循环，需要在 tokio 运行时中调用
    pub fn spawn(self) -> BrokerHandle {
        let (inbox, receiver) = mpsc::unbounded_channel();
        let registered: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        info!("[BUS] 分发循环启动，已注册处理器: {:?}", registered);

        let task = tokio::spawn(dispatch_loop(Arc::new(self.handlers), receiver));

        BrokerHandle {
            inner: Arc::new(HandleInner {
                inbox,
                install_hook: self.install_hook,
                installed: AtomicBool::new(false),
                next_context: AtomicU64::new(1),
                abort: task.abort_handle(),
            }),
        }
    }
}

struct HandleInner {
    inbox: mpsc::UnboundedSender<Inbound>,
    install_hook: Option<Arc<dyn InstallHook>>,
    installed: AtomicBool,
    next_context: AtomicU64,
    abort: AbortHandle,
}

/// 运行中代理的句柄，可以克隆并传给需要连接总线的上下文
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<HandleInner>,
}

impl BrokerHandle {
    /// 以新的上下文连接总线，不设超时
    pub fn connect(&self, kind: ContextKind) -> BusClient {
        self.connect_with(self.sender_context(kind), None)
    }

    /// 分配一个新的发送方上下文
    pub fn sender_context(&self, kind: ContextKind) -> SenderContext {
        let n = self.inner.next_context.fetch_add(1, Ordering::Relaxed);
        SenderContext::new(format!("ctx-{}", n), kind)
    }

    /// 以指定的发送方上下文和回复超时连接总线
    pub fn connect_with(&self, sender: SenderContext, timeout: Option<Duration>) -> BusClient {
        debug!("[BUS] 上下文 {} ({:?}) 已连接", sender.id, sender.kind);
        BusClient::new(sender, self.inner.inbox.clone(), timeout)
    }

    /// 触发安装钩子
    ///
    /// 每个代理进程只会执行一次；返回钩子是否在这次调用中执行。
    pub async fn notify_install(&self, reason: InstallReason) -> BrokerResult<bool> {
        if self
            .inner
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[BACKGROUND] 安装钩子已执行过，忽略重复通知: {}", reason);
            return Ok(false);
        }

        let Some(hook) = self.inner.install_hook.clone() else {
            debug!("[BACKGROUND] 没有注册安装钩子: {}", reason);
            return Ok(false);
        };

        info!("[BACKGROUND] 执行安装钩子: {}", reason);
        hook.on_install(reason).await?;
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        !self.inner.inbox.is_closed()
    }

    /// 停止分发循环
    ///
    /// 队列中尚未分发的请求以传输错误结束；正在执行的处理器不会被取消。
    pub fn shutdown(&self) {
        info!("[BUS] 分发循环停止");
        self.inner.abort.abort();
    }
}

async fn dispatch_loop(
    handlers: Arc<HashMap<MessageType, Arc<dyn Handler>>>,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(inbound) = inbox.recv().await {
        let Inbound {
            message,
            sender,
            responder,
        } = inbound;
        let message_type = message.message_type();

        let Some(handler) = handlers.get(&message_type).cloned() else {
            warn!(
                "[BUS] 消息 {} 的类型 {} 没有注册处理器",
                message.id, message_type
            );
            responder.reply_error(BrokerError::NoHandler(message_type));
            continue;
        };

        debug!(
            "[BUS] 分发消息 {} ({}) 来自 {}",
            message.id, message_type, sender.id
        );
        responder.mark_dispatched();
        tokio::spawn(invoke(handler, message, sender, responder));
    }

    debug!("[BUS] 收件箱已关闭，分发循环退出");
}

async fn invoke(
    handler: Arc<dyn Handler>,
    message: Message,
    sender: SenderContext,
    responder: Responder,
) {
    let message_id = message.id.clone();
    let message_type = message.message_type();
    let handler_responder = responder.clone();

    let outcome = AssertUnwindSafe(async move {
        handler.handle(message, sender, handler_responder).await
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            helpers::log_error(
                &error,
                &format!("[BUS] 处理器 {} 处理消息 {} 失败", message_type, message_id),
            );
            if !responder.reply_error(&error) {
                debug!("[BUS] 消息 {} 已回复或无需回复，错误只记录", message_id);
            }
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(
                "[BUS] 处理器 {} 处理消息 {} 时崩溃: {}",
                message_type, message_id, reason
            );
            responder.reply_error(
                ErrorDescriptor::new(format!("处理器崩溃: {}", reason)).with_kind("panic"),
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::Request;
    use crate::handlers::speech::TtsPayload;
    use crate::history::TranslatePayload;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn lookup(text: &str) -> Request {
        Request::GetFromHistory(TranslatePayload {
            text: text.to_string(),
            from: "en".to_string(),
            to: "de".to_string(),
            vendor: "google".to_string(),
        })
    }

    fn echo_text(message: Message) -> String {
        match message.request {
            Request::GetFromHistory(payload) => payload.text,
            _ => String::new(),
        }
    }

    #[tokio::test]
    async fn test_send_resolves_with_handler_data() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |message: Message, _sender: SenderContext, responder: Responder| async move {
                responder.reply(&json!({ "echo": echo_text(message) }));
                Ok(())
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        let data = client.send(lookup("hello")).await.unwrap();
        assert_eq!(data, Some(json!({ "echo": "hello" })));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_rejection() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |_m: Message, _s: SenderContext, _r: Responder| async move {
                Err(BrokerError::StorageError("disk on fire".to_string()))
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        match client.send(lookup("x")).await {
            Err(BrokerError::HandlerError(descriptor)) => {
                assert_eq!(descriptor.kind.as_deref(), Some("storage"));
                assert!(descriptor.message.contains("disk on fire"));
            }
            other => panic!("expected handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |_m: Message, _s: SenderContext, _r: Responder| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok(())
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        match client.send(lookup("x")).await {
            Err(BrokerError::HandlerError(descriptor)) => {
                assert_eq!(descriptor.kind.as_deref(), Some("panic"));
                assert!(descriptor.message.contains("handler exploded"));
            }
            other => panic!("expected panic descriptor, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_handler_is_reported() {
        let client = Broker::new().spawn().connect(ContextKind::ExtensionPage);

        match client.send(Request::TtsStop).await {
            Err(BrokerError::HandlerError(descriptor)) => {
                assert_eq!(descriptor.kind.as_deref(), Some("routing"));
                assert!(descriptor.message.contains("tts-stop"));
            }
            other => panic!("expected routing error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_without_reply_resolves_empty() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::TtsStop,
            |_m: Message, _s: SenderContext, _r: Responder| async move { Ok(()) },
        );
        let client = broker.spawn().connect(ContextKind::ContentScript { tab_id: 3 });

        assert_eq!(client.send(Request::TtsStop).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reply_after_handler_returns() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |message: Message, _s: SenderContext, responder: Responder| async move {
                let text = echo_text(message);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    responder.reply(&text);
                });
                Ok(())
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        let data = client.send(lookup("later")).await.unwrap();
        assert_eq!(data, Some(json!("later")));
    }

    #[tokio::test]
    async fn test_second_reply_is_ignored() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |_m: Message, _s: SenderContext, responder: Responder| async move {
                assert!(responder.reply(&1));
                assert!(!responder.reply(&2));
                assert!(!responder.expects_reply());
                Ok(())
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        assert_eq!(client.send(lookup("x")).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_out_of_order_completion_is_correlated_by_id() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |message: Message, _s: SenderContext, responder: Responder| async move {
                let text = echo_text(message);
                let delay = if text == "slow" { 60 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                responder.reply(&text);
                Ok(())
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        let (slow, fast) = tokio::join!(client.send(lookup("slow")), client.send(lookup("fast")));
        assert_eq!(slow.unwrap(), Some(json!("slow")));
        assert_eq!(fast.unwrap(), Some(json!("fast")));
    }

    #[tokio::test]
    async fn test_fire_and_forget_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());

        let mut broker = Broker::new();
        let (counter, done) = (Arc::clone(&calls), Arc::clone(&notify));
        broker.register_handler(
            MessageType::TtsPlay,
            move |_m: Message, _s: SenderContext, responder: Responder| {
                let counter = Arc::clone(&counter);
                let done = Arc::clone(&done);
                async move {
                    assert!(!responder.expects_reply());
                    counter.fetch_add(1, Ordering::SeqCst);
                    done.notify_one();
                    Ok(())
                }
            },
        );
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        client.send_fire_and_forget(Request::TtsPlay(TtsPayload {
            text: "hi".to_string(),
            lang: "en".to_string(),
            rate: None,
        }));
        notify.notified().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut broker = Broker::new();
        broker.register_handler(
            MessageType::GetFromHistory,
            |_m: Message, _s: SenderContext, r: Responder| async move {
                r.reply(&"first");
                Ok(())
            },
        );
        broker.register_handler(
            MessageType::GetFromHistory,
            |_m: Message, _s: SenderContext, r: Responder| async move {
                r.reply(&"second");
                Ok(())
            },
        );
        assert!(broker.has_handler(MessageType::GetFromHistory));
        let client = broker.spawn().connect(ContextKind::ExtensionPage);

        assert_eq!(client.send(lookup("x")).await.unwrap(), Some(json!("second")));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_disconnected() {
        let handle = Broker::new().spawn();
        let client = handle.connect(ContextKind::ExtensionPage);
        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!handle.is_running());
        assert!(matches!(
            client.send(Request::TtsStop).await,
            Err(BrokerError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_install_hook_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let mut broker = Broker::new();
        broker.set_install_hook(move |reason: InstallReason| {
            let counter = Arc::clone(&counter);
            async move {
                assert!(reason.is_fresh_install());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let handle = broker.spawn();

        assert!(handle.notify_install(InstallReason::Install).await.unwrap());
        assert!(!handle.notify_install(InstallReason::Install).await.unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_undispatched_responder_reports_transport_error() {
        let (sink, mut replies) = mpsc::unbounded_channel();
        drop(Responder::new(MessageId::from("lost"), Some(sink)));

        let envelope = replies.try_recv().unwrap();
        assert_eq!(envelope.message_id.as_str(), "lost");
        assert!(matches!(
            envelope.into_result(),
            Err(BrokerError::Disconnected(_))
        ));
    }

    #[test]
    fn test_dropped_dispatched_responder_sends_empty_reply() {
        let (sink, mut replies) = mpsc::unbounded_channel();
        let responder = Responder::new(MessageId::from("quiet"), Some(sink));
        responder.mark_dispatched();
        drop(responder);

        assert!(replies.try_recv().unwrap().is_empty());
    }
}
