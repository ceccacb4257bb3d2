//! 语音朗读处理器

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::unexpected_request;
use crate::bus::{Handler, Message, MessageType, Request, Responder, SenderContext};
use crate::config::constants::{MAX_SPEECH_RATE, MIN_SPEECH_RATE};
use crate::error::BrokerResult;

/// `tts-play` 负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsPayload {
    pub text: String,
    pub lang: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f32>,
}

/// 朗读参数
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOptions {
    pub lang: String,
    pub rate: f32,
}

/// 语音合成引擎
#[async_trait]
pub trait SpeechEngine: Send + Sync + 'static {
    async fn speak(&self, text: &str, options: SpeechOptions) -> BrokerResult<()>;

    async fn stop(&self) -> BrokerResult<()>;
}

/// 只记录日志的语音引擎，用于没有系统语音的环境
#[derive(Debug, Default, Clone)]
pub struct LoggingSpeechEngine;

#[async_trait]
impl SpeechEngine for LoggingSpeechEngine {
    async fn speak(&self, text: &str, options: SpeechOptions) -> BrokerResult<()> {
        info!(
            "[TTS] 朗读 {} 个字符 (语言: {}, 语速: {})",
            text.chars().count(),
            options.lang,
            options.rate
        );
        Ok(())
    }

    async fn stop(&self) -> BrokerResult<()> {
        info!("[TTS] 停止朗读");
        Ok(())
    }
}

/// `tts-play` 处理器
#[derive(Clone)]
pub struct TtsPlayHandler {
    engine: Arc<dyn SpeechEngine>,
    default_rate: f32,
}

impl TtsPlayHandler {
    pub fn new(engine: Arc<dyn SpeechEngine>, default_rate: f32) -> Self {
        Self {
            engine,
            default_rate,
        }
    }

    /// 缺省语速取默认值，超出范围的语速被截断到允许区间
    fn resolve_rate(&self, requested: Option<f32>) -> f32 {
        match requested {
            None => self.default_rate,
            Some(rate) if !rate.is_finite() => {
                warn!("[TTS] 无效语速 {}，使用默认值 {}", rate, self.default_rate);
                self.default_rate
            }
            Some(rate) if !(MIN_SPEECH_RATE..=MAX_SPEECH_RATE).contains(&rate) => {
                let clamped = rate.clamp(MIN_SPEECH_RATE, MAX_SPEECH_RATE);
                warn!("[TTS] 语速 {} 超出范围，截断为 {}", rate, clamped);
                clamped
            }
            Some(rate) => rate,
        }
    }
}

impl Handler for TtsPlayHandler {
    fn handle(
        &self,
        message: Message,
        _sender: SenderContext,
        _responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let handler = self.clone();
        Box::pin(async move {
            let payload = match message.request {
                Request::TtsPlay(payload) => payload,
                other => return Err(unexpected_request(MessageType::TtsPlay, &other)),
            };

            let options = SpeechOptions {
                lang: payload.lang,
                rate: handler.resolve_rate(payload.rate),
            };
            handler.engine.speak(&payload.text, options).await
        })
    }
}

/// `tts-stop` 处理器
#[derive(Clone)]
pub struct TtsStopHandler {
    engine: Arc<dyn SpeechEngine>,
}

impl TtsStopHandler {
    pub fn new(engine: Arc<dyn SpeechEngine>) -> Self {
        Self { engine }
    }
}

impl Handler for TtsStopHandler {
    fn handle(
        &self,
        message: Message,
        _sender: SenderContext,
        _responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let engine = Arc::clone(&self.engine);
        Box::pin(async move {
            if message.message_type() != MessageType::TtsStop {
                return Err(unexpected_request(MessageType::TtsStop, &message.request));
            }
            engine.stop().await
        })
    }
}
