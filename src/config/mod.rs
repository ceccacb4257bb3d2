//! 配置管理模块
//!
//! 提供后台代理的配置加载，支持配置文件、环境变量和默认值

pub mod manager;

// 重新导出主要类型
pub use manager::{
    BrokerConfig, BusConfig, HistoryConfig, ProxyConfig, RunMode, SpeechConfig, StorageConfig,
};

/// 配置常量
pub mod constants {
    use std::time::Duration;

    // 存储
    pub const DEFAULT_STORAGE_DIR: &str = "~/.local/share/xtranslate";
    pub const HISTORY_NAMESPACE: &str = "history";
    pub const APP_RATE_NAMESPACE: &str = "app_rate";

    // 网络代理
    pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_USER_AGENT: &str = concat!("xtranslate/", env!("CARGO_PKG_VERSION"));

    // 语音
    pub const DEFAULT_SPEECH_RATE: f32 = 1.0;
    pub const MIN_SPEECH_RATE: f32 = 0.1;
    pub const MAX_SPEECH_RATE: f32 = 10.0;

    // 配置文件搜索路径
    pub const CONFIG_PATHS: &[&str] = &[
        "xtranslate.toml",
        ".xtranslate.toml",
        "~/.config/xtranslate/broker.toml",
        "/etc/xtranslate/broker.toml",
    ];

    // .env 文件搜索顺序
    pub const ENV_FILES: &[&str] = &[".env.local", ".env"];
}
