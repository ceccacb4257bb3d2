//! 持久化存储
//!
//! - `backend`: 后端接口与内存、文件两种实现
//! - `helper`: 在后端之上的类型化存储助手

pub mod backend;
pub mod helper;

pub use backend::{FileBackend, MemoryBackend, StorageArea, StorageBackend, StorageChange};
pub use helper::{StorageHelper, StorageHelperOptions, StorageValue};
