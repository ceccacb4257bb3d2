//! 后台上下文装配
//!
//! 创建存储、翻译缓存和全部处理器，注册安装钩子，然后启动总线。
//! 所有协作者都通过 [`BackgroundDeps`] 注入。

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bus::{
    Broker, BrokerHandle, BusClient, ContextKind, InstallHook, InstallReason, MessageType,
};
use crate::config::constants::APP_RATE_NAMESPACE;
use crate::config::{BrokerConfig, RunMode};
use crate::error::BrokerResult;
use crate::handlers::{
    GetFromHistoryHandler, LoggingSpeechEngine, ProxyHandler, SaveToHistoryHandler, SpeechEngine,
    TtsPlayHandler, TtsStopHandler,
};
use crate::history::TranslationCache;
use crate::storage::{StorageArea, StorageBackend, StorageHelper, StorageHelperOptions};

/// 评分提醒的持久化状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppRateState {
    /// 上次提醒的时间，Unix 毫秒
    #[serde(default)]
    pub last_timestamp: Option<i64>,
}

/// 选项页
#[async_trait]
pub trait OptionsPage: Send + Sync + 'static {
    async fn open(&self) -> BrokerResult<()>;
}

/// 只记录日志的选项页
#[derive(Debug, Default, Clone)]
pub struct LoggingOptionsPage;

#[async_trait]
impl OptionsPage for LoggingOptionsPage {
    async fn open(&self) -> BrokerResult<()> {
        info!("[BACKGROUND] 打开选项页");
        Ok(())
    }
}

/// 后台上下文的外部协作者
#[derive(Clone)]
pub struct BackgroundDeps {
    pub backend: Arc<dyn StorageBackend>,
    pub speech: Arc<dyn SpeechEngine>,
    pub options_page: Arc<dyn OptionsPage>,
}

impl BackgroundDeps {
    /// 使用给定后端，语音和选项页只记录日志
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            speech: Arc::new(LoggingSpeechEngine),
            options_page: Arc::new(LoggingOptionsPage),
        }
    }
}

/// 安装钩子：全新安装（或非生产模式下的任何安装事件）时记录时间并打开选项页
#[derive(Clone)]
pub struct RateReminderHook {
    mode: RunMode,
    app_rate: StorageHelper<AppRateState>,
    options_page: Arc<dyn OptionsPage>,
}

impl RateReminderHook {
    pub fn new(
        mode: RunMode,
        app_rate: StorageHelper<AppRateState>,
        options_page: Arc<dyn OptionsPage>,
    ) -> Self {
        Self {
            mode,
            app_rate,
            options_page,
        }
    }
}

impl InstallHook for RateReminderHook {
    fn on_install(&self, reason: InstallReason) -> BoxFuture<'static, BrokerResult<()>> {
        let hook = self.clone();
        Box::pin(async move {
            if !reason.is_fresh_install() && hook.mode.is_production() {
                debug!("[BACKGROUND] 更新安装，跳过评分提醒: {}", reason);
                return Ok(());
            }

            hook.app_rate.load().await?;
            hook.app_rate
                .set(AppRateState {
                    last_timestamp: Some(chrono::Utc::now().timestamp_millis()),
                })
                .await?;
            hook.options_page.open().await
        })
    }
}

/// 运行中的后台上下文
pub struct Background {
    broker: BrokerHandle,
    history: TranslationCache,
    app_rate: StorageHelper<AppRateState>,
    config: BrokerConfig,
}

impl Background {
    /// 装配并启动，需要在 tokio 运行时中调用
    pub fn start(config: &BrokerConfig, deps: BackgroundDeps) -> BrokerResult<Self> {
        let history = TranslationCache::new(Arc::clone(&deps.backend), config.history.area);
        let app_rate = StorageHelper::new(
            APP_RATE_NAMESPACE,
            StorageHelperOptions {
                area: StorageArea::Sync,
                auto_load: true,
                default_value: AppRateState::default(),
            },
            Arc::clone(&deps.backend),
        );

        let mut broker = Broker::new();
        broker
            .register_handler(MessageType::ProxyRequest, ProxyHandler::new(&config.proxy)?)
            .register_handler(
                MessageType::SaveToHistory,
                SaveToHistoryHandler::new(history.clone()),
            )
            .register_handler(
                MessageType::GetFromHistory,
                GetFromHistoryHandler::new(history.clone()),
            )
            .register_handler(
                MessageType::TtsPlay,
                TtsPlayHandler::new(Arc::clone(&deps.speech), config.speech.default_rate),
            )
            .register_handler(MessageType::TtsStop, TtsStopHandler::new(deps.speech))
            .set_install_hook(RateReminderHook::new(
                config.mode,
                app_rate.clone(),
                deps.options_page,
            ));

        let broker = broker.spawn();
        info!(
            "[BACKGROUND] 后台已启动 (模式: {:?}, 历史区域: {})",
            config.mode, config.history.area
        );

        Ok(Self {
            broker,
            history,
            app_rate,
            config: config.clone(),
        })
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    pub fn history(&self) -> &TranslationCache {
        &self.history
    }

    pub fn app_rate(&self) -> &StorageHelper<AppRateState> {
        &self.app_rate
    }

    /// 连接一个新的上下文，使用配置的请求超时
    pub fn connect(&self, kind: ContextKind) -> BusClient {
        self.broker
            .connect_with(self.broker.sender_context(kind), self.config.bus.request_timeout())
    }

    /// 通知安装事件，返回钩子是否执行
    pub async fn notify_install(&self, reason: InstallReason) -> BrokerResult<bool> {
        self.broker.notify_install(reason).await
    }

    /// 停止分发并把历史写入后端
    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.broker.shutdown();
        if self.history.storage().is_ready() {
            self.history.flush().await?;
        }
        if self.app_rate.is_ready() {
            self.app_rate.flush().await?;
        }
        info!("[BACKGROUND] 后台已停止");
        Ok(())
    }
}
