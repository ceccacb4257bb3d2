//! 持久化后端
//!
//! 后端按（区域, 命名空间）存取整个 JSON 文档，并广播每一次变更，
//! 让同一后端上的其他存储助手可以观察到别处的写入。

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{helpers, BrokerError, BrokerResult};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// 存储区域：本机或跨设备同步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    #[default]
    Local,
    Sync,
}

impl StorageArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Local => "local",
            StorageArea::Sync => "sync",
        }
    }
}

impl fmt::Display for StorageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 存储变更通知
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub area: StorageArea,
    pub namespace: String,
    /// 写入方标识，外部写入为 `None`
    pub origin: Option<String>,
    /// 新值，删除时为 `None`
    pub value: Option<Value>,
}

/// 持久化后端接口
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// 读取命名空间的文档，不存在时返回 `None`
    async fn load(&self, area: StorageArea, namespace: &str) -> BrokerResult<Option<Value>>;

    /// 整体覆盖写入命名空间的文档
    async fn save(
        &self,
        area: StorageArea,
        namespace: &str,
        value: Value,
        origin: Option<&str>,
    ) -> BrokerResult<()>;

    /// 删除命名空间
    async fn remove(
        &self,
        area: StorageArea,
        namespace: &str,
        origin: Option<&str>,
    ) -> BrokerResult<()>;

    /// 订阅变更通知
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// 内存后端
///
/// 进程退出即丢失，主要用于测试和嵌入场景；可以注入读写失败。
pub struct MemoryBackend {
    documents: DashMap<(StorageArea, String), Value>,
    changes: broadcast::Sender<StorageChange>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            documents: DashMap::new(),
            changes,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让之后的读取全部失败
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 让之后的写入全部失败
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 直接查看当前持久化的内容
    pub fn peek(&self, area: StorageArea, namespace: &str) -> Option<Value> {
        self.documents
            .get(&(area, namespace.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// 成功写入（含删除）的次数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> BrokerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BrokerError::StorageError("内存后端被设置为写入失败".to_string()));
        }
        Ok(())
    }

    fn publish(
        &self,
        area: StorageArea,
        namespace: &str,
        origin: Option<&str>,
        value: Option<Value>,
    ) {
        // 没有订阅者时发送失败是正常的
        let _ = self.changes.send(StorageChange {
            area,
            namespace: namespace.to_string(),
            origin: origin.map(str::to_string),
            value,
        });
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self, area: StorageArea, namespace: &str) -> BrokerResult<Option<Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BrokerError::StorageError("内存后端被设置为读取失败".to_string()));
        }
        Ok(self.peek(area, namespace))
    }

    async fn save(
        &self,
        area: StorageArea,
        namespace: &str,
        value: Value,
        origin: Option<&str>,
    ) -> BrokerResult<()> {
        self.check_writable()?;
        self.documents
            .insert((area, namespace.to_string()), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(area, namespace, origin, Some(value));
        Ok(())
    }

    async fn remove(
        &self,
        area: StorageArea,
        namespace: &str,
        origin: Option<&str>,
    ) -> BrokerResult<()> {
        self.check_writable()?;
        if self.documents.remove(&(area, namespace.to_string())).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.publish(area, namespace, origin, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// 文件后端
///
/// 布局为 `<root>/<area>/<namespace>.json`，写入先落到临时文件再原子重命名。
/// 变更通知只在本进程内广播。
pub struct FileBackend {
    root: PathBuf,
    changes: broadcast::Sender<StorageChange>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let root = root.into();
        info!("[STORAGE] 文件存储目录: {}", root.display());
        Self { root, changes }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, area: StorageArea, namespace: &str) -> BrokerResult<PathBuf> {
        validate_namespace(namespace)?;
        Ok(self
            .root
            .join(area.as_str())
            .join(format!("{}.json", namespace)))
    }
}

/// 命名空间只能由字母、数字、`_`、`-`、`.` 组成，且不能以 `.` 开头
fn validate_namespace(namespace: &str) -> BrokerResult<()> {
    let valid = !namespace.is_empty()
        && !namespace.starts_with('.')
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidInput(format!(
            "非法的存储命名空间: {:?}",
            namespace
        )))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load(&self, area: StorageArea, namespace: &str) -> BrokerResult<Option<Value>> {
        let path = self.document_path(area, namespace)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(helpers::storage_error(format!(
                    "读取 {} 失败: {}",
                    path.display(),
                    e
                )))
            }
        };

        let value = serde_json::from_slice(&bytes).map_err(|e| {
            helpers::storage_error(format!("{} 内容不是有效的JSON: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }

    async fn save(
        &self,
        area: StorageArea,
        namespace: &str,
        value: Value,
        origin: Option<&str>,
    ) -> BrokerResult<()> {
        let path = self.document_path(area, namespace)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(&value)?;
        let temp_path = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| BrokerError::from(e).with_context(temp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(helpers::storage_error(format!(
                "替换 {} 失败: {}",
                path.display(),
                e
            )));
        }

        debug!("[STORAGE] 已写入 {} ({} 字节)", path.display(), bytes.len());
        let _ = self.changes.send(StorageChange {
            area,
            namespace: namespace.to_string(),
            origin: origin.map(str::to_string),
            value: Some(value),
        });
        Ok(())
    }

    async fn remove(
        &self,
        area: StorageArea,
        namespace: &str,
        origin: Option<&str>,
    ) -> BrokerResult<()> {
        let path = self.document_path(area, namespace)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                let _ = self.changes.send(StorageChange {
                    area,
                    namespace: namespace.to_string(),
                    origin: origin.map(str::to_string),
                    value: None,
                });
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
