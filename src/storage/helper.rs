//! 存储助手
//!
//! 把一个持久化命名空间包装成类型化的值：
//! - 内存镜像同步更新，持久化异步完成，多次快速写入会被合并
//! - 加载完成前的读写返回 [`BrokerError::StorageNotReady`]
//! - 同一后端上其他写入方的变更会被观察并应用到镜像（最后写入者胜出）

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use super::backend::{StorageArea, StorageBackend, StorageChange};
use crate::error::{helpers, BrokerError, BrokerResult};

/// 可以放进存储助手的值
pub trait StorageValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> StorageValue for T {}

/// 存储助手选项
#[derive(Debug, Clone)]
pub struct StorageHelperOptions<T> {
    pub area: StorageArea,
    /// 创建时是否立即在后台加载
    pub auto_load: bool,
    /// 命名空间不存在时使用并写入的默认值
    pub default_value: T,
}

impl<T: Default> Default for StorageHelperOptions<T> {
    fn default() -> Self {
        Self {
            area: StorageArea::Local,
            auto_load: true,
            default_value: T::default(),
        }
    }
}

/// 类型化存储助手，克隆后共享同一份状态
pub struct StorageHelper<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StorageHelper<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    key: String,
    area: StorageArea,
    default_value: T,
    backend: Arc<dyn StorageBackend>,
    /// 本实例写入时携带的来源标识，用来忽略自己产生的变更通知
    origin: String,
    state: RwLock<Option<T>>,
    /// 每次修改镜像递增
    version: AtomicU64,
    /// 已写入后端的最新版本
    persisted: AtomicU64,
    writer: Mutex<()>,
    loaded: OnceCell<()>,
    ready: watch::Sender<bool>,
}

impl<T: StorageValue> StorageHelper<T> {
    pub fn new(
        key: impl Into<String>,
        options: StorageHelperOptions<T>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        let helper = Self {
            inner: Arc::new(Inner {
                key: key.into(),
                area: options.area,
                default_value: options.default_value,
                backend,
                origin: format!("helper-{}", uuid::Uuid::new_v4().simple()),
                state: RwLock::new(None),
                version: AtomicU64::new(0),
                persisted: AtomicU64::new(0),
                writer: Mutex::new(()),
                loaded: OnceCell::new(),
                ready,
            }),
        };

        if options.auto_load {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let loader = helper.clone();
                    runtime.spawn(async move {
                        if let Err(e) = loader.load().await {
                            helpers::log_error(
                                &e,
                                &format!("[STORAGE] 自动加载 {} 失败", loader.key()),
                            );
                        }
                    });
                }
                Err(_) => {
                    debug!(
                        "[STORAGE] 不在异步运行时中，{} 需要手动调用 load",
                        helper.key()
                    );
                }
            }
        }

        helper
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn area(&self) -> StorageArea {
        self.inner.area
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// 加载持久化内容
    ///
    /// 只有第一次成功的调用会真正读取后端，并发调用会等待同一次加载。
    /// 命名空间不存在时写入默认值；这次写入失败只记录日志，助手仍然就绪。
    /// 已有内容无法还原成 `T` 时返回存储错误，助手保持未就绪，后端内容不变。
    pub async fn load(&self) -> BrokerResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .loaded
            .get_or_try_init(|| async move { Inner::initialize(inner).await })
            .await?;
        Ok(())
    }

    /// 等待加载完成
    pub async fn when_ready(&self) -> BrokerResult<()> {
        let mut ready = self.inner.ready.subscribe();
        ready
            .wait_for(|loaded| *loaded)
            .await
            .map_err(|_| BrokerError::InternalError(format!("存储 {} 已被释放", self.key())))?;
        Ok(())
    }

    /// 当前值的拷贝
    pub fn get(&self) -> BrokerResult<T> {
        self.with(T::clone)
    }

    /// 在读锁下访问当前值
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> BrokerResult<R> {
        let state = self.inner.read_state();
        match state.as_ref() {
            Some(value) => Ok(f(value)),
            None => Err(self.not_ready()),
        }
    }

    /// 整体替换
    pub async fn set(&self, value: T) -> BrokerResult<()> {
        self.modify(|state| *state = value)?;
        self.persist().await
    }

    /// 浅合并：`patch` 的每个顶层字段覆盖当前值的同名字段
    ///
    /// 当前值和 `patch` 都必须是 JSON 对象；合并结果无法还原成 `T` 时不做任何修改。
    pub async fn merge(&self, patch: Value) -> BrokerResult<()> {
        let Value::Object(fields) = patch else {
            return Err(BrokerError::InvalidInput(format!(
                "存储 {} 的合并内容必须是对象",
                self.key()
            )));
        };

        {
            let mut state = self.inner.write_state();
            let Some(current) = state.as_mut() else {
                return Err(self.not_ready());
            };

            let mut merged = match serde_json::to_value(&*current)? {
                Value::Object(map) => map,
                _ => {
                    return Err(BrokerError::InvalidInput(format!(
                        "存储 {} 的值不是对象，无法合并",
                        self.key()
                    )))
                }
            };
            merged.extend(fields);
            *current = serde_json::from_value(Value::Object(merged))?;
            self.inner.version.fetch_add(1, Ordering::AcqRel);
        }

        self.persist().await
    }

    /// 就地修改并持久化，返回闭包的结果
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> BrokerResult<R> {
        let result = self.modify(f)?;
        self.persist().await?;
        Ok(result)
    }

    /// 恢复默认值
    pub async fn reset(&self) -> BrokerResult<()> {
        self.set(self.inner.default_value.clone()).await
    }

    /// 等待所有已发生的修改写入后端
    pub async fn flush(&self) -> BrokerResult<()> {
        self.inner.persist_latest().await
    }

    fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> BrokerResult<R> {
        let mut state = self.inner.write_state();
        let Some(current) = state.as_mut() else {
            return Err(self.not_ready());
        };
        let result = f(current);
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        Ok(result)
    }

    /// 在独立任务中写入，调用方放弃等待时写入照常完成
    async fn persist(&self) -> BrokerResult<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.persist_latest().await })
            .await
            .map_err(|e| BrokerError::InternalError(format!("存储写入任务异常结束: {}", e)))?
    }

    fn not_ready(&self) -> BrokerError {
        BrokerError::StorageNotReady(self.inner.key.clone())
    }
}

impl<T: StorageValue> Inner<T> {
    fn read_state(&self) -> RwLockReadGuard<'_, Option<T>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<T>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn initialize(inner: Arc<Self>) -> BrokerResult<()> {
        // 先订阅再读取，避免错过两者之间的外部写入
        let changes = inner.backend.subscribe();
        let stored = inner.backend.load(inner.area, &inner.key).await?;

        // 已有内容无法解析时保持未就绪，不用默认值覆盖
        let (value, seed) = match stored {
            Some(raw) => match serde_json::from_value::<T>(raw) {
                Ok(value) => (value, false),
                Err(e) => {
                    return Err(helpers::storage_error(format!(
                        "{}/{} 的内容无法解析: {}",
                        inner.area, inner.key, e
                    )));
                }
            },
            None => (inner.default_value.clone(), true),
        };

        *inner.write_state() = Some(value.clone());

        if seed {
            let seeded = match serde_json::to_value(&value) {
                Ok(raw) => {
                    inner
                        .backend
                        .save(inner.area, &inner.key, raw, Some(&inner.origin))
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = seeded {
                helpers::log_error(
                    &e,
                    &format!("[STORAGE] 写入 {}/{} 的默认值失败", inner.area, inner.key),
                );
            }
        }

        tokio::spawn(watch_changes(
            Arc::downgrade(&inner),
            changes,
            inner.ready.subscribe(),
        ));
        inner.ready.send_replace(true);
        info!("[STORAGE] {}/{} 已就绪", inner.area, inner.key);
        Ok(())
    }

    async fn persist_latest(&self) -> BrokerResult<()> {
        let _writer = self.writer.lock().await;

        let (version, snapshot) = {
            let state = self.read_state();
            let Some(value) = state.as_ref() else {
                return Err(BrokerError::StorageNotReady(self.key.clone()));
            };
            let version = self.version.load(Ordering::Acquire);
            if version <= self.persisted.load(Ordering::Acquire) {
                return Ok(());
            }
            (version, serde_json::to_value(value)?)
        };

        self.backend
            .save(self.area, &self.key, snapshot, Some(&self.origin))
            .await?;
        self.persisted.fetch_max(version, Ordering::AcqRel);
        debug!("[STORAGE] {}/{} 已写入版本 {}", self.area, self.key, version);
        Ok(())
    }

    /// 应用其他写入方的变更，尚未写出的本地修改被视为已被覆盖
    fn apply_external(&self, value: Option<Value>) {
        let next = match value {
            Some(raw) => match serde_json::from_value::<T>(raw) {
                Ok(next) => next,
                Err(e) => {
                    warn!(
                        "[STORAGE] 忽略 {}/{} 无法解析的外部变更: {}",
                        self.area, self.key, e
                    );
                    return;
                }
            },
            None => self.default_value.clone(),
        };

        let mut state = self.write_state();
        *state = Some(next);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.persisted.fetch_max(version, Ordering::AcqRel);
        debug!("[STORAGE] {}/{} 已应用外部变更", self.area, self.key);
    }

    async fn reload(&self) {
        match self.backend.load(self.area, &self.key).await {
            Ok(value) => self.apply_external(value),
            Err(e) => error!("[STORAGE] 重新加载 {}/{} 失败: {}", self.area, self.key, e),
        }
    }
}

/// 监听后端变更，助手被全部释放后退出
async fn watch_changes<T: StorageValue>(
    inner: Weak<Inner<T>>,
    mut changes: broadcast::Receiver<StorageChange>,
    mut alive: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = changes.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match received {
                    Ok(change) => {
                        if change.area != inner.area
                            || change.namespace != inner.key
                            || change.origin.as_deref() == Some(inner.origin.as_str())
                        {
                            continue;
                        }
                        inner.apply_external(change.value);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "[STORAGE] {}/{} 错过了 {} 条变更通知，重新加载",
                            inner.area, inner.key, skipped
                        );
                        inner.reload().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            still_alive = alive.changed() => {
                if still_alive.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        font_size: u32,
    }

    fn manual(default_value: Prefs) -> StorageHelperOptions<Prefs> {
        StorageHelperOptions {
            area: StorageArea::Local,
            auto_load: false,
            default_value,
        }
    }

    #[tokio::test]
    async fn test_operations_before_load_are_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend);

        assert!(!helper.is_ready());
        assert!(matches!(helper.get(), Err(BrokerError::StorageNotReady(_))));
        assert!(matches!(
            helper.set(Prefs::default()).await,
            Err(BrokerError::StorageNotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_load_seeds_default_value() {
        let backend = Arc::new(MemoryBackend::new());
        let default_value = Prefs {
            theme: "light".to_string(),
            font_size: 14,
        };
        let helper = StorageHelper::new("prefs", manual(default_value.clone()), backend.clone());

        helper.load().await.unwrap();
        helper.load().await.unwrap();

        assert!(helper.is_ready());
        assert_eq!(helper.get().unwrap(), default_value);
        assert_eq!(
            backend.peek(StorageArea::Local, "prefs"),
            Some(json!({ "theme": "light", "font_size": 14 }))
        );
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_seed_failure_still_becomes_ready() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_writes(true);
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());

        helper.load().await.unwrap();
        assert!(helper.is_ready());
        assert_eq!(backend.peek(StorageArea::Local, "prefs"), None);
    }

    #[tokio::test]
    async fn test_load_failure_can_be_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_fail_reads(true);
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());

        assert!(helper.load().await.is_err());
        assert!(!helper.is_ready());

        backend.set_fail_reads(false);
        helper.load().await.unwrap();
        assert!(helper.is_ready());
    }

    #[tokio::test]
    async fn test_undecodable_document_is_never_overwritten() {
        let backend = Arc::new(MemoryBackend::new());
        let stored = json!({ "theme": "dark" });
        backend
            .save(StorageArea::Local, "prefs", stored.clone(), None)
            .await
            .unwrap();
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());

        assert!(matches!(helper.load().await, Err(BrokerError::StorageError(_))));
        assert!(!helper.is_ready());
        assert!(matches!(
            helper.update(|p| p.font_size = 30).await,
            Err(BrokerError::StorageNotReady(_))
        ));
        assert_eq!(backend.peek(StorageArea::Local, "prefs"), Some(stored));
    }

    #[tokio::test]
    async fn test_auto_load_and_when_ready() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .save(StorageArea::Sync, "prefs", json!({ "theme": "dark", "font_size": 18 }), None)
            .await
            .unwrap();

        let helper = StorageHelper::new(
            "prefs",
            StorageHelperOptions {
                area: StorageArea::Sync,
                auto_load: true,
                default_value: Prefs::default(),
            },
            backend,
        );
        tokio::time::timeout(Duration::from_secs(1), helper.when_ready())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(helper.with(|p| p.font_size).unwrap(), 18);
    }

    #[tokio::test]
    async fn test_set_merge_update_and_reset() {
        let backend = Arc::new(MemoryBackend::new());
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());
        helper.load().await.unwrap();

        helper
            .set(Prefs {
                theme: "dark".to_string(),
                font_size: 12,
            })
            .await
            .unwrap();
        helper.merge(json!({ "font_size": 16 })).await.unwrap();
        assert_eq!(helper.get().unwrap().theme, "dark");
        assert_eq!(helper.get().unwrap().font_size, 16);

        let previous = helper
            .update(|p| std::mem::replace(&mut p.font_size, 20))
            .await
            .unwrap();
        assert_eq!(previous, 16);
        assert_eq!(
            backend.peek(StorageArea::Local, "prefs"),
            Some(json!({ "theme": "dark", "font_size": 20 }))
        );

        helper.reset().await.unwrap();
        assert_eq!(helper.get().unwrap(), Prefs::default());
    }

    #[tokio::test]
    async fn test_invalid_merge_leaves_value_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend);
        helper.load().await.unwrap();

        assert!(helper.merge(json!({ "font_size": "huge" })).await.is_err());
        assert!(helper.merge(json!(3)).await.is_err());
        assert_eq!(helper.get().unwrap(), Prefs::default());
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Layout {
        title: String,
        panel: Panel,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Panel {
        #[serde(default)]
        width: u32,
        #[serde(default)]
        pinned: bool,
    }

    #[tokio::test]
    async fn test_merge_replaces_nested_objects_wholesale() {
        let backend = Arc::new(MemoryBackend::new());
        let helper = StorageHelper::new(
            "layout",
            StorageHelperOptions {
                area: StorageArea::Local,
                auto_load: false,
                default_value: Layout {
                    title: "popup".to_string(),
                    panel: Panel {
                        width: 320,
                        pinned: true,
                    },
                },
            },
            backend.clone(),
        );
        helper.load().await.unwrap();

        helper.merge(json!({ "panel": { "width": 480 } })).await.unwrap();

        let layout = helper.get().unwrap();
        assert_eq!(layout.title, "popup");
        // 嵌套对象整体替换，未给出的 pinned 回到字段默认值
        assert_eq!(
            layout.panel,
            Panel {
                width: 480,
                pinned: false,
            }
        );
        assert_eq!(
            backend.peek(StorageArea::Local, "layout"),
            Some(json!({ "title": "popup", "panel": { "width": 480, "pinned": false } }))
        );
    }

    #[tokio::test]
    async fn test_rapid_updates_are_coalesced() {
        let backend = Arc::new(MemoryBackend::new());
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());
        helper.load().await.unwrap();
        let seeded_writes = backend.write_count();

        let updates = (1..=20u32).map(|size| {
            let helper = helper.clone();
            async move { helper.update(|p| p.font_size = p.font_size.max(size)).await }
        });
        for result in futures::future::join_all(updates).await {
            result.unwrap();
        }
        helper.flush().await.unwrap();

        assert_eq!(helper.get().unwrap().font_size, 20);
        assert_eq!(
            backend.peek(StorageArea::Local, "prefs").unwrap()["font_size"],
            json!(20)
        );
        assert!(backend.write_count() - seeded_writes <= 20);
    }

    #[tokio::test]
    async fn test_external_changes_are_observed() {
        let backend = Arc::new(MemoryBackend::new());
        let first = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());
        let second = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());
        first.load().await.unwrap();
        second.load().await.unwrap();

        first.update(|p| p.theme = "dark".to_string()).await.unwrap();

        let mut observed = false;
        for _ in 0..50 {
            if second.get().unwrap().theme == "dark" {
                observed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(observed);
        // 自己的写入不会被当作外部变更再应用一次
        assert_eq!(first.get().unwrap().theme, "dark");
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        let helper = StorageHelper::new("prefs", manual(Prefs::default()), backend.clone());
        helper.load().await.unwrap();

        backend.set_fail_writes(true);
        let result = helper.update(|p| p.font_size = 99).await;
        assert!(matches!(result, Err(BrokerError::StorageError(_))));
        // 镜像已经同步更新
        assert_eq!(helper.get().unwrap().font_size, 99);

        backend.set_fail_writes(false);
        helper.flush().await.unwrap();
        assert_eq!(
            backend.peek(StorageArea::Local, "prefs").unwrap()["font_size"],
            json!(99)
        );
    }
}
