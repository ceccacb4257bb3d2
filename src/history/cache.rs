//! 翻译缓存
//!
//! 历史文档 `{ translations: { [翻译ID]: { [供应商]: 条目 } } }` 作为一个整体存放在
//! 存储助手中，每次写入都是对当前文档的读-改-写。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::item::{HistoryItem, TranslatePayload, TranslationResult};
use crate::config::constants::HISTORY_NAMESPACE;
use crate::error::{BrokerError, BrokerResult};
use crate::storage::{StorageArea, StorageBackend, StorageHelper, StorageHelperOptions};

/// 持久化的历史文档
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDocument {
    #[serde(default)]
    pub translations: BTreeMap<String, BTreeMap<String, HistoryItem>>,
}

impl HistoryDocument {
    pub fn get(&self, translation_id: &str, vendor: &str) -> Option<&HistoryItem> {
        self.translations.get(translation_id)?.get(vendor)
    }

    fn newest_timestamp(items: &BTreeMap<String, HistoryItem>) -> i64 {
        items.values().map(|item| item.timestamp).max().unwrap_or(i64::MIN)
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub total_entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    saves: AtomicU64,
}

/// 内容寻址的翻译缓存
#[derive(Clone)]
pub struct TranslationCache {
    storage: StorageHelper<HistoryDocument>,
    counters: Arc<Counters>,
}

impl TranslationCache {
    /// 在给定后端和区域上创建缓存，首次操作时才加载
    pub fn new(backend: Arc<dyn StorageBackend>, area: StorageArea) -> Self {
        let storage = StorageHelper::new(
            HISTORY_NAMESPACE,
            StorageHelperOptions {
                area,
                auto_load: false,
                default_value: HistoryDocument::default(),
            },
            backend,
        );

        Self {
            storage,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn storage(&self) -> &StorageHelper<HistoryDocument> {
        &self.storage
    }

    /// 确保历史文档已加载，可以重复调用
    pub async fn load(&self) -> BrokerResult<()> {
        self.storage.load().await
    }

    /// 保存翻译结果，返回翻译 ID
    pub async fn save(&self, result: &TranslationResult) -> BrokerResult<String> {
        self.insert(HistoryItem::now(result)).await
    }

    /// 写入条目，同一 ID 同一供应商的旧条目被替换，其他供应商不受影响
    pub async fn insert(&self, item: HistoryItem) -> BrokerResult<String> {
        if item.vendor.trim().is_empty() {
            return Err(BrokerError::InvalidInput("历史条目缺少供应商".to_string()));
        }
        self.load().await?;

        let translation_id = item.translation_id();
        let vendor = item.vendor.clone();
        let id = translation_id.clone();
        self.storage
            .update(move |doc| {
                doc.translations
                    .entry(id)
                    .or_default()
                    .insert(item.vendor.clone(), item);
            })
            .await?;

        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        debug!("[HISTORY] 已保存 {} ({})", translation_id, vendor);
        Ok(translation_id)
    }

    /// 查询缓存，未命中时返回 `None`
    pub async fn lookup(
        &self,
        payload: &TranslatePayload,
    ) -> BrokerResult<Option<TranslationResult>> {
        let item = self
            .get_item(&payload.translation_id(), &payload.vendor)
            .await?;

        match item {
            Some(item) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(item.to_result()))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn get_item(
        &self,
        translation_id: &str,
        vendor: &str,
    ) -> BrokerResult<Option<HistoryItem>> {
        self.load().await?;
        self.storage.with(|doc| doc.get(translation_id, vendor).cloned())
    }

    /// 删除一个供应商的条目，ID 下没有条目时一并删除，返回是否删除了内容
    pub async fn remove(&self, translation_id: &str, vendor: &str) -> BrokerResult<bool> {
        self.load().await?;
        let removed = self
            .storage
            .update(|doc| {
                let Some(vendors) = doc.translations.get_mut(translation_id) else {
                    return false;
                };
                let removed = vendors.remove(vendor).is_some();
                if vendors.is_empty() {
                    doc.translations.remove(translation_id);
                }
                removed
            })
            .await?;
        Ok(removed)
    }

    /// 清空历史
    pub async fn clear(&self) -> BrokerResult<()> {
        self.load().await?;
        self.storage.reset().await?;
        info!("[HISTORY] 历史已清空");
        Ok(())
    }

    /// 只保留最新的 `max_entries` 个翻译 ID（按 ID 下最新条目的时间），返回删除的 ID 数
    pub async fn trim_oldest(&self, max_entries: usize) -> BrokerResult<usize> {
        self.load().await?;
        if self.len().await? <= max_entries {
            return Ok(0);
        }

        let removed = self
            .storage
            .update(|doc| {
                let mut ranked: Vec<(i64, String)> = doc
                    .translations
                    .iter()
                    .map(|(id, items)| (HistoryDocument::newest_timestamp(items), id.clone()))
                    .collect();
                ranked.sort_by(|a, b| b.cmp(a));

                let stale: Vec<String> = ranked
                    .into_iter()
                    .skip(max_entries)
                    .map(|(_, id)| id)
                    .collect();
                for id in &stale {
                    doc.translations.remove(id);
                }
                stale.len()
            })
            .await?;

        info!("[HISTORY] 裁剪历史，删除了 {} 个翻译", removed);
        Ok(removed)
    }

    /// 翻译 ID 的数量
    pub async fn len(&self) -> BrokerResult<usize> {
        self.load().await?;
        self.storage.with(|doc| doc.translations.len())
    }

    pub async fn is_empty(&self) -> BrokerResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// 等待所有修改写入后端
    pub async fn flush(&self) -> BrokerResult<()> {
        self.storage.flush().await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            saves: self.counters.saves.load(Ordering::Relaxed),
            total_entries: self
                .storage
                .with(|doc| doc.translations.len())
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn item(text: &str, vendor: &str, translation: &str, timestamp: i64) -> HistoryItem {
        HistoryItem {
            source_text: text.to_string(),
            translation: translation.to_string(),
            source_lang: "en".to_string(),
            target_lang: "de".to_string(),
            vendor: vendor.to_string(),
            timestamp,
            auto_detected: false,
            transcription: None,
            raw_vendor_payload: None,
        }
    }

    fn cache() -> (TranslationCache, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (TranslationCache::new(backend.clone(), StorageArea::Local), backend)
    }

    #[tokio::test]
    async fn test_insert_and_get_item() {
        let (cache, backend) = cache();
        let id = cache.insert(item("hello", "google", "hallo", 1)).await.unwrap();

        assert_eq!(
            cache.get_item(&id, "google").await.unwrap().unwrap().translation,
            "hallo"
        );
        assert_eq!(cache.get_item(&id, "bing").await.unwrap(), None);

        let stored = backend.peek(StorageArea::Local, HISTORY_NAMESPACE).unwrap();
        assert_eq!(stored["translations"][&id]["google"]["translation"], "hallo");
    }

    #[tokio::test]
    async fn test_missing_vendor_is_rejected() {
        let (cache, _) = cache();
        assert!(matches!(
            cache.insert(item("hello", " ", "hallo", 1)).await,
            Err(BrokerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_drops_empty_ids() {
        let (cache, _) = cache();
        let id = cache.insert(item("hello", "google", "hallo", 1)).await.unwrap();
        cache.insert(item("hello", "bing", "hallo!", 2)).await.unwrap();

        assert!(cache.remove(&id, "google").await.unwrap());
        assert!(!cache.remove(&id, "google").await.unwrap());
        assert_eq!(cache.len().await.unwrap(), 1);

        assert!(cache.remove(&id, "bing").await.unwrap());
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_trim_oldest_keeps_most_recent_ids() {
        let (cache, _) = cache();
        let old = cache.insert(item("one", "google", "eins", 10)).await.unwrap();
        let refreshed = cache.insert(item("two", "google", "zwei", 20)).await.unwrap();
        let newest = cache.insert(item("three", "google", "drei", 30)).await.unwrap();
        // 另一个供应商刷新了 "two" 的时间
        cache.insert(item("two", "bing", "zwei", 40)).await.unwrap();

        assert_eq!(cache.trim_oldest(5).await.unwrap(), 0);
        assert_eq!(cache.trim_oldest(2).await.unwrap(), 1);

        assert_eq!(cache.get_item(&old, "google").await.unwrap(), None);
        assert!(cache.get_item(&refreshed, "google").await.unwrap().is_some());
        assert!(cache.get_item(&newest, "google").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let (cache, _) = cache();
        cache.insert(item("hello", "google", "hallo", 1)).await.unwrap();

        let hit = TranslatePayload {
            text: "hello".to_string(),
            from: "en".to_string(),
            to: "de".to_string(),
            vendor: "google".to_string(),
        };
        let miss = TranslatePayload {
            vendor: "deepl".to_string(),
            ..hit.clone()
        };
        assert!(cache.lookup(&hit).await.unwrap().is_some());
        assert!(cache.lookup(&miss).await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.saves), (1, 1, 1));
        assert_eq!(stats.total_entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);

        cache.clear().await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
        assert!(cache.lookup(&hit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_from_lookup() {
        let (cache, backend) = cache();
        backend.set_fail_reads(true);

        let payload = TranslatePayload {
            text: "hello".to_string(),
            from: "en".to_string(),
            to: "de".to_string(),
            vendor: "google".to_string(),
        };
        assert!(matches!(
            cache.lookup(&payload).await,
            Err(BrokerError::StorageError(_))
        ));
    }
}
