//! 翻译历史
//!
//! - `item`: 翻译结果、历史条目与翻译 ID
//! - `cache`: 基于存储助手的内容寻址翻译缓存

pub mod cache;
pub mod item;

pub use cache::{CacheStats, HistoryDocument, TranslationCache};
pub use item::{
    generate_id, HistoryItem, SaveToHistoryPayload, TranslatePayload, TranslationResult,
    AUTO_DETECT,
};
