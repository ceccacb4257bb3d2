//! 网络代理处理器
//!
//! 页面上下文不能直接发起跨域请求，由后台代为请求并把响应体按指定格式返回。
//! 每个请求只尝试一次；任何失败都写进回复的 `error` 字段，请求本身总会得到回复。

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use url::Url;

use super::unexpected_request;
use crate::bus::{Handler, Message, MessageId, MessageType, Request, Responder, SenderContext};
use crate::config::ProxyConfig;
use crate::error::{helpers, BrokerError, BrokerResult, ErrorDescriptor};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 响应体格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyResponseType {
    Json,
    Text,
    DataUri,
}

/// 请求参数，原样转发给目标服务器
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInit {
    /// 缺省为 GET
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequestPayload {
    pub url: String,
    pub response_type: ProxyResponseType,
    #[serde(default)]
    pub request_init: RequestInit,
}

impl ProxyRequestPayload {
    pub fn get(url: impl Into<String>, response_type: ProxyResponseType) -> Self {
        Self {
            url: url.into(),
            response_type,
            request_init: RequestInit::default(),
        }
    }
}

/// 代理回复，`url` 总是请求的原始地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub message_id: MessageId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl ProxyResponse {
    fn new(message_id: MessageId, url: String) -> Self {
        Self {
            message_id,
            url,
            status: None,
            data: None,
            error: None,
        }
    }

    fn fail(mut self, error: &BrokerError) -> Self {
        self.data = None;
        self.error = Some(ErrorDescriptor::from(error));
        self
    }
}

/// 网络代理处理器
#[derive(Clone)]
pub struct ProxyHandler {
    client: reqwest::Client,
}

impl ProxyHandler {
    pub fn new(config: &ProxyConfig) -> BrokerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| BrokerError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self { client })
    }

    /// 执行一次代理请求
    pub async fn execute(
        &self,
        message_id: MessageId,
        payload: ProxyRequestPayload,
    ) -> ProxyResponse {
        let response = ProxyResponse::new(message_id, payload.url.clone());

        let http = match self.send(&payload).await {
            Ok(http) => http,
            Err(e) => {
                error!("[PROXY] 请求 {} 失败: {}", payload.url, e);
                return response.fail(&e);
            }
        };

        let mut response = response;
        response.status = Some(http.status().as_u16());

        match read_body(http, payload.response_type).await {
            Ok(data) => {
                response.data = Some(data);
                response
            }
            Err(e) => {
                error!("[PROXY] 转换 {} 的响应体失败: {}", payload.url, e);
                response.fail(&e)
            }
        }
    }

    async fn send(&self, payload: &ProxyRequestPayload) -> BrokerResult<reqwest::Response> {
        let url = Url::parse(&payload.url)
            .map_err(|e| helpers::validation_error(format!("无效的URL {}: {}", payload.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(helpers::validation_error(format!(
                "不支持的URL协议: {}",
                url.scheme()
            )));
        }

        let init = &payload.request_init;
        let method = match init.method.as_deref() {
            None => Method::GET,
            Some(method) => Method::from_bytes(method.trim().to_uppercase().as_bytes())
                .map_err(|_| helpers::validation_error(format!("无效的HTTP方法: {}", method)))?,
        };

        info!("[PROXY] 代理请求 {} {} ({:?})", method, url, payload.response_type);

        let mut request = self.client.request(method, url);
        for (name, value) in &init.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &init.body {
            request = request.body(body.clone());
        }

        Ok(request.send().await?)
    }
}

/// 完整读取响应体并按格式转换
async fn read_body(
    response: reqwest::Response,
    response_type: ProxyResponseType,
) -> BrokerResult<Value> {
    match response_type {
        ProxyResponseType::Json => {
            let bytes = response.bytes().await?;
            serde_json::from_slice(&bytes)
                .map_err(|e| BrokerError::ParseError(format!("响应不是有效的JSON: {}", e)))
        }
        ProxyResponseType::Text => Ok(Value::String(response.text().await?)),
        ProxyResponseType::DataUri => {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = response.bytes().await?;
            Ok(Value::String(to_data_uri(content_type.as_deref(), &bytes)))
        }
    }
}

/// 生成 `data:<类型>;base64,<内容>`
pub fn to_data_uri(content_type: Option<&str>, bytes: &[u8]) -> String {
    let content_type = content_type
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

impl Handler for ProxyHandler {
    fn handle(
        &self,
        message: Message,
        _sender: SenderContext,
        responder: Responder,
    ) -> BoxFuture<'static, BrokerResult<()>> {
        let handler = self.clone();
        Box::pin(async move {
            let payload = match message.request {
                Request::ProxyRequest(payload) => payload,
                other => return Err(unexpected_request(MessageType::ProxyRequest, &other)),
            };

            let response = handler.execute(message.id, payload).await;
            responder.reply(&response);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler() -> ProxyHandler {
        ProxyHandler::new(&ProxyConfig::default()).unwrap()
    }

    #[test]
    fn test_payload_wire_format() {
        let payload: ProxyRequestPayload = serde_json::from_value(json!({
            "url": "https://translate.example.com/api",
            "responseType": "DATA_URI",
            "requestInit": {
                "method": "post",
                "headers": { "Content-Type": "application/json" },
                "body": "{}"
            }
        }))
        .unwrap();

        assert_eq!(payload.response_type, ProxyResponseType::DataUri);
        assert_eq!(payload.request_init.method.as_deref(), Some("post"));
        assert_eq!(payload.request_init.headers.len(), 1);

        let minimal: ProxyRequestPayload =
            serde_json::from_value(json!({ "url": "http://x", "responseType": "TEXT" })).unwrap();
        assert_eq!(minimal.request_init, RequestInit::default());
    }

    #[test]
    fn test_data_uri_encoding() {
        assert_eq!(
            to_data_uri(Some("image/png"), &[0x89, 0x50, 0x4e, 0x47]),
            "data:image/png;base64,iVBORw=="
        );
        assert_eq!(to_data_uri(None, b"hi"), "data:application/octet-stream;base64,aGk=");
        assert_eq!(to_data_uri(Some("  "), b""), "data:application/octet-stream;base64,");
    }

    #[tokio::test]
    async fn test_unsupported_scheme_never_hits_network() {
        let response = handler()
            .execute(
                MessageId::from("p-1"),
                ProxyRequestPayload::get("file:///etc/passwd", ProxyResponseType::Text),
            )
            .await;

        assert_eq!(response.url, "file:///etc/passwd");
        assert_eq!(response.status, None);
        assert_eq!(response.data, None);
        assert_eq!(response.error.unwrap().kind.as_deref(), Some("input"));
    }

    #[tokio::test]
    async fn test_malformed_url_and_method() {
        let response = handler()
            .execute(
                MessageId::from("p-2"),
                ProxyRequestPayload::get("not a url", ProxyResponseType::Json),
            )
            .await;
        assert!(response.error.is_some());
        assert_eq!(response.url, "not a url");

        let mut payload = ProxyRequestPayload::get("http://127.0.0.1:9/", ProxyResponseType::Json);
        payload.request_init.method = Some("GE T".to_string());
        let response = handler().execute(MessageId::from("p-3"), payload).await;
        assert!(response.error.unwrap().message.contains("GE T"));
    }

    #[test]
    fn test_response_serialization_skips_empty_fields() {
        let response = ProxyResponse::new(MessageId::from("m"), "https://a.b".to_string());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "messageId": "m", "url": "https://a.b" })
        );
    }
}
