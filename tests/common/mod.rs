// 集成测试公共模块
//
// 提供内存后台、HTTP 测试服务器和测试数据

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};

use xtranslate::background::{Background, BackgroundDeps, OptionsPage};
use xtranslate::config::BrokerConfig;
use xtranslate::error::BrokerResult;
use xtranslate::handlers::{SpeechEngine, SpeechOptions};
use xtranslate::history::{TranslatePayload, TranslationResult};
use xtranslate::storage::MemoryBackend;

/// 记录调用的语音引擎
#[derive(Default)]
pub struct RecordingSpeech {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingSpeech {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechEngine for RecordingSpeech {
    async fn speak(&self, text: &str, options: SpeechOptions) -> BrokerResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("speak:{}:{}:{}", text, options.lang, options.rate));
        Ok(())
    }

    async fn stop(&self) -> BrokerResult<()> {
        self.calls.lock().unwrap().push("stop".to_string());
        Ok(())
    }
}

/// 记录打开次数的选项页
#[derive(Default)]
pub struct RecordingOptionsPage {
    pub opened: AtomicUsize,
}

#[async_trait]
impl OptionsPage for RecordingOptionsPage {
    async fn open(&self) -> BrokerResult<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 基于内存后端的测试后台
pub struct TestBackground {
    pub background: Background,
    pub backend: Arc<MemoryBackend>,
    pub speech: Arc<RecordingSpeech>,
    pub options_page: Arc<RecordingOptionsPage>,
}

impl TestBackground {
    pub fn start() -> Self {
        Self::start_with(test_config())
    }

    pub fn start_with(config: BrokerConfig) -> Self {
        Self::start_on(config, Arc::new(MemoryBackend::new()))
    }

    /// 在已有后端上启动，用来模拟重启或共享存储
    pub fn start_on(config: BrokerConfig, backend: Arc<MemoryBackend>) -> Self {
        let speech = Arc::new(RecordingSpeech::default());
        let options_page = Arc::new(RecordingOptionsPage::default());
        let deps = BackgroundDeps {
            backend: backend.clone(),
            speech: speech.clone(),
            options_page: options_page.clone(),
        };

        Self {
            background: Background::start(&config, deps).expect("后台启动失败"),
            backend,
            speech,
            options_page,
        }
    }
}

/// 测试配置：较短的代理超时
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.proxy.timeout_secs = 5;
    config
}

pub fn sample_translation(text: &str, translation: &str, vendor: &str) -> TranslationResult {
    TranslationResult {
        vendor: vendor.to_string(),
        source_text: text.to_string(),
        translation: translation.to_string(),
        source_lang: "en".to_string(),
        target_lang: "de".to_string(),
        detected_lang: None,
        transcription: None,
        raw: Some(json!({ "vendor": vendor })),
    }
}

pub fn lookup(text: &str, from: &str, to: &str, vendor: &str) -> TranslatePayload {
    TranslatePayload {
        text: text.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        vendor: vendor.to_string(),
    }
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// PNG 文件头，DATA_URI 测试用
pub const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4e, 0x47];

/// 启动本地 HTTP 测试服务器
pub async fn spawn_fixture_server() -> SocketAddr {
    let app = Router::new()
        .route("/json", get(|| async { Json(json!({ "greeting": "hallo", "count": 2 })) }))
        .route("/text", get(|| async { "plain body" }))
        .route(
            "/image",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], PNG_MAGIC.to_vec()) }),
        )
        .route("/broken-json", get(|| async { "{ definitely not json" }))
        .route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({ "error": "missing" }))) }),
        )
        .route("/echo", any(echo));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("绑定测试端口失败");
    let addr = listener.local_addr().expect("读取测试端口失败");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("测试服务器异常退出");
    });
    addr
}

async fn echo(method: Method, headers: HeaderMap, body: String) -> impl IntoResponse {
    let header = headers
        .get("x-client")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    Json(json!({
        "method": method.as_str(),
        "client": header,
        "userAgent": agent,
        "body": body,
    }))
}

/// 一个当前没有监听的本地地址
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("绑定测试端口失败");
    let addr = listener.local_addr().expect("读取测试端口失败");
    drop(listener);
    format!("http://{}/", addr)
}

pub fn value_str(value: &Value) -> &str {
    value.as_str().unwrap_or_default()
}
