//! 配置加载与验证
//!
//! 加载顺序：配置文件（TOML）→ 环境变量覆盖 → 验证

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants;
use crate::error::{helpers, BrokerError, BrokerResult};
use crate::storage::StorageArea;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Development,
    #[default]
    Production,
}

impl RunMode {
    pub fn is_production(&self) -> bool {
        matches!(self, RunMode::Production)
    }
}

/// 消息总线配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 等待回复的超时秒数，0 表示无限等待
    pub request_timeout_secs: u64,
}

impl BusConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: constants::DEFAULT_STORAGE_DIR.to_string(),
        }
    }
}

/// 网络代理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: constants::DEFAULT_PROXY_TIMEOUT.as_secs(),
            user_agent: constants::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 语音配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub default_rate: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            default_rate: constants::DEFAULT_SPEECH_RATE,
        }
    }
}

/// 翻译历史配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub area: StorageArea,
    /// 启动时裁剪到的最大条目数，未设置时不裁剪
    pub max_entries: Option<usize>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            area: StorageArea::Local,
            max_entries: None,
        }
    }
}

/// 后台代理配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: RunMode,
    pub bus: BusConfig,
    pub storage: StorageConfig,
    pub proxy: ProxyConfig,
    pub speech: SpeechConfig,
    pub history: HistoryConfig,
}

impl BrokerConfig {
    /// 加载配置
    ///
    /// 显式给出的路径必须存在；否则按 [`constants::CONFIG_PATHS`] 顺序查找，
    /// 都不存在时使用默认配置。随后应用环境变量覆盖并验证。
    pub fn load(path: Option<&Path>) -> BrokerResult<Self> {
        Self::load_dotenv();

        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::discover()?,
        };
        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// 从 TOML 文本解析配置（不应用环境变量）
    pub fn from_toml_str(content: &str) -> BrokerResult<Self> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn discover() -> BrokerResult<Self> {
        for path in constants::CONFIG_PATHS {
            let expanded_path = shellexpand::tilde(path);
            let candidate = Path::new(expanded_path.as_ref());
            if candidate.exists() {
                tracing::info!("加载配置文件: {}", expanded_path);
                return Self::load_from_file(candidate);
            }
        }

        tracing::info!("未找到配置文件，使用默认配置");
        Ok(Self::default())
    }

    fn load_from_file(path: &Path) -> BrokerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            helpers::config_error(format!("读取配置文件 {} 失败: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            helpers::config_error(format!("解析TOML配置 {} 失败: {}", path.display(), e))
        })
    }

    /// 加载第一个存在的环境变量文件，已设置的变量不会被覆盖
    pub fn load_dotenv() -> Option<&'static str> {
        let loaded = constants::ENV_FILES.iter().copied().find(|env_file| {
            Path::new(env_file).exists() && dotenv::from_filename(env_file).is_ok()
        });
        if let Some(env_file) = loaded {
            tracing::info!("已加载环境变量文件: {}", env_file);
        }
        loaded
    }

    /// 应用环境变量覆盖
    ///
    /// 未设置的变量保持配置文件中的值；已设置但无法解析的变量视为配置错误。
    pub fn apply_env_overrides(&mut self) -> BrokerResult<()> {
        use crate::env::{bus, core, history, proxy, storage, EnvVar};

        let invalid = |e: crate::env::EnvError| BrokerError::ConfigError(e.to_string());

        if let Some(mode) = core::Mode::get_set() {
            self.mode = match mode.map_err(invalid)?.as_str() {
                "development" => RunMode::Development,
                _ => RunMode::Production,
            };
        }

        if let Some(dir) = storage::Dir::get_set() {
            self.storage.dir = dir.map_err(invalid)?;
            tracing::info!("环境变量覆盖存储目录: {}", self.storage.dir);
        }

        if let Some(timeout) = bus::RequestTimeout::get_set() {
            self.bus.request_timeout_secs = timeout.map_err(invalid)?.as_secs();
        }

        if let Some(timeout) = proxy::Timeout::get_set() {
            self.proxy.timeout_secs = timeout.map_err(invalid)?.as_secs();
        }

        if let Some(agent) = proxy::UserAgent::get_set() {
            self.proxy.user_agent = agent.map_err(invalid)?;
        }

        if let Some(max_entries) = history::MaxEntries::get_set() {
            self.history.max_entries = Some(max_entries.map_err(invalid)?);
        }

        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> BrokerResult<()> {
        if self.storage.dir.trim().is_empty() {
            return Err(BrokerError::ConfigError("存储目录不能为空".to_string()));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(BrokerError::ConfigError("代理超时必须大于0".to_string()));
        }

        if self.proxy.user_agent.trim().is_empty() {
            return Err(BrokerError::ConfigError("User-Agent 不能为空".to_string()));
        }

        let rate = self.speech.default_rate;
        if !(constants::MIN_SPEECH_RATE..=constants::MAX_SPEECH_RATE).contains(&rate) {
            return Err(BrokerError::ConfigError(format!(
                "默认语速 {} 超出范围 [{}, {}]",
                rate,
                constants::MIN_SPEECH_RATE,
                constants::MAX_SPEECH_RATE
            )));
        }

        if self.history.max_entries == Some(0) {
            return Err(BrokerError::ConfigError("历史最大条目数不能为0".to_string()));
        }

        Ok(())
    }

    /// 展开 `~` 后的存储目录
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage.dir).as_ref())
    }

    /// 生成示例配置文件内容
    pub fn example_toml() -> BrokerResult<String> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| BrokerError::ConfigError(format!("序列化配置失败: {}", e)))
    }
}
