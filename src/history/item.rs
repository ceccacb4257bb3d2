//! 翻译结果与历史条目
//!
//! 翻译 ID 只由规范化后的（原文, 源语言, 目标语言）决定，供应商作为 ID 下的二级键。

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 自动检测源语言时使用的语言代码
pub const AUTO_DETECT: &str = "auto";

/// 字段分隔符，避免 ("ab", "c") 与 ("a", "bc") 产生相同输入
const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// 供应商返回的翻译结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationResult {
    pub vendor: String,
    pub source_text: String,
    pub translation: String,
    /// 请求时的源语言，可能是 `auto`
    pub source_lang: String,
    pub target_lang: String,
    /// 自动检测出的源语言
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    /// 供应商原始响应
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl TranslationResult {
    pub fn translation_id(&self) -> String {
        generate_id(&self.source_text, &self.source_lang, &self.target_lang)
    }
}

/// 持久化的历史条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub source_text: String,
    pub translation: String,
    /// 实际的源语言（自动检测时为检测结果）
    pub source_lang: String,
    pub target_lang: String,
    pub vendor: String,
    /// 保存时间，Unix 毫秒
    pub timestamp: i64,
    #[serde(default)]
    pub auto_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_vendor_payload: Option<Value>,
}

impl HistoryItem {
    /// 从翻译结果创建条目
    pub fn from_result(result: &TranslationResult, timestamp: i64) -> Self {
        let auto_detected = is_auto(&result.source_lang);
        let source_lang = match (&result.detected_lang, auto_detected) {
            (Some(detected), true) if !detected.trim().is_empty() => detected.clone(),
            _ => result.source_lang.clone(),
        };

        Self {
            source_text: result.source_text.clone(),
            translation: result.translation.clone(),
            source_lang,
            target_lang: result.target_lang.clone(),
            vendor: result.vendor.clone(),
            timestamp,
            auto_detected,
            transcription: result.transcription.clone(),
            raw_vendor_payload: result.raw.clone(),
        }
    }

    /// 以当前时间创建条目
    pub fn now(result: &TranslationResult) -> Self {
        Self::from_result(result, chrono::Utc::now().timestamp_millis())
    }

    /// 条目所在的翻译 ID，与保存时请求的参数一致
    pub fn translation_id(&self) -> String {
        generate_id(&self.source_text, self.requested_lang(), &self.target_lang)
    }

    fn requested_lang(&self) -> &str {
        if self.auto_detected {
            AUTO_DETECT
        } else {
            &self.source_lang
        }
    }

    /// 自动检测且确有检测结果时返回检测出的语言
    fn detected_lang(&self) -> Option<&str> {
        if self.auto_detected && !is_auto(&self.source_lang) {
            Some(&self.source_lang)
        } else {
            None
        }
    }

    /// 还原成翻译结果
    pub fn to_result(&self) -> TranslationResult {
        TranslationResult {
            vendor: self.vendor.clone(),
            source_text: self.source_text.clone(),
            translation: self.translation.clone(),
            source_lang: self.requested_lang().to_string(),
            target_lang: self.target_lang.clone(),
            detected_lang: self.detected_lang().map(str::to_string),
            transcription: self.transcription.clone(),
            raw: self.raw_vendor_payload.clone(),
        }
    }
}

impl From<HistoryItem> for TranslationResult {
    fn from(item: HistoryItem) -> Self {
        item.to_result()
    }
}

/// 翻译请求参数，也是历史查询的输入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatePayload {
    pub text: String,
    pub from: String,
    pub to: String,
    pub vendor: String,
}

impl TranslatePayload {
    pub fn translation_id(&self) -> String {
        generate_id(&self.text, &self.from, &self.to)
    }
}

/// 保存到历史的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveToHistoryPayload {
    pub translation: TranslationResult,
}

/// 计算翻译 ID
///
/// 原文去掉首尾空白、折叠连续空白并转小写，语言代码去空白并转小写，
/// 再用 blake3 计算十六进制摘要。
pub fn generate_id(text: &str, source_lang: &str, target_lang: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(normalize_text(text).as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(normalize_lang(source_lang).as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(normalize_lang(target_lang).as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_lang(lang: &str) -> String {
    lang.trim().to_lowercase()
}

fn is_auto(lang: &str) -> bool {
    normalize_lang(lang) == AUTO_DETECT
}
