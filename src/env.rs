//! 统一的环境变量管理系统
//!
//! 提供类型安全、可验证的环境变量访问，所有变量都以 `XTRANSLATE_` 为前缀

use std::env;
use std::fmt;
use std::time::Duration;

/// 环境变量解析错误
#[derive(Debug, Clone)]
pub struct EnvError {
    pub variable: String,
    pub message: String,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment variable '{}': {}", self.variable, self.message)
    }
}

impl std::error::Error for EnvError {}

pub type EnvResult<T> = Result<T, EnvError>;

/// 环境变量访问器特性
pub trait EnvVar<T> {
    const NAME: &'static str;
    const DEFAULT: Option<T>;
    const DESCRIPTION: &'static str;

    fn parse(value: &str) -> EnvResult<T>;

    fn get() -> EnvResult<T> {
        match env::var(Self::NAME) {
            Ok(value) => Self::parse(&value),
            Err(_) => {
                if let Some(default) = Self::DEFAULT {
                    Ok(default)
                } else {
                    Err(EnvError {
                        variable: Self::NAME.to_string(),
                        message: "Required environment variable not set".to_string(),
                    })
                }
            }
        }
    }

    /// 只在变量被显式设置时返回值，解析失败同样视为错误
    fn get_set() -> Option<EnvResult<T>> {
        env::var(Self::NAME).ok().map(|value| Self::parse(&value))
    }
}

/// 核心环境变量定义
pub mod core {
    use super::*;

    /// 运行模式
    pub struct Mode;
    impl EnvVar<String> for Mode {
        const NAME: &'static str = "XTRANSLATE_MODE";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Run mode: development, production";

        fn get() -> EnvResult<String> {
            match env::var(Self::NAME) {
                Ok(value) => Self::parse(&value),
                Err(_) => Ok("production".to_string()),
            }
        }

        fn parse(value: &str) -> EnvResult<String> {
            match value.trim().to_lowercase().as_str() {
                "development" | "dev" => Ok("development".to_string()),
                "production" | "prod" => Ok("production".to_string()),
                _ => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!("Invalid mode '{}'. Use: development, production", value),
                }),
            }
        }
    }

    /// 日志级别
    pub struct LogLevel;
    impl EnvVar<String> for LogLevel {
        const NAME: &'static str = "XTRANSLATE_LOG_LEVEL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Log level: trace, debug, info, warn, error";

        fn get() -> EnvResult<String> {
            match env::var(Self::NAME) {
                Ok(value) => Self::parse(&value),
                Err(_) => Ok("info".to_string()),
            }
        }

        fn parse(value: &str) -> EnvResult<String> {
            let level = value.trim().to_lowercase();
            match level.as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => Ok(level),
                _ => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!(
                        "Invalid log level '{}'. Use: trace, debug, info, warn, error",
                        value
                    ),
                }),
            }
        }
    }
}

/// 存储相关环境变量
pub mod storage {
    use super::*;

    /// 存储目录
    pub struct Dir;
    impl EnvVar<String> for Dir {
        const NAME: &'static str = "XTRANSLATE_STORAGE_DIR";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str =
            "Directory holding one JSON document per storage namespace";

        fn parse(value: &str) -> EnvResult<String> {
            let dir = value.trim();
            if dir.is_empty() {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "Storage directory must not be empty".to_string(),
                });
            }
            Ok(dir.to_string())
        }
    }
}

/// 消息总线相关环境变量
pub mod bus {
    use super::*;

    /// 请求等待回复的超时时间，0 表示无限等待
    pub struct RequestTimeout;
    impl EnvVar<Duration> for RequestTimeout {
        const NAME: &'static str = "XTRANSLATE_REQUEST_TIMEOUT";
        const DEFAULT: Option<Duration> = Some(Duration::from_secs(0));
        const DESCRIPTION: &'static str =
            "Seconds a bus client waits for a reply (0 waits forever)";

        fn parse(value: &str) -> EnvResult<Duration> {
            parse_seconds(value, Self::NAME, 0, 3600)
        }
    }
}

/// 网络代理相关环境变量
pub mod proxy {
    use super::*;

    /// 代理请求超时
    pub struct Timeout;
    impl EnvVar<Duration> for Timeout {
        const NAME: &'static str = "XTRANSLATE_PROXY_TIMEOUT";
        const DEFAULT: Option<Duration> = Some(Duration::from_secs(30));
        const DESCRIPTION: &'static str = "Proxy HTTP request timeout in seconds";

        fn parse(value: &str) -> EnvResult<Duration> {
            parse_seconds(value, Self::NAME, 1, 600)
        }
    }

    /// 代理请求使用的 User-Agent
    pub struct UserAgent;
    impl EnvVar<String> for UserAgent {
        const NAME: &'static str = "XTRANSLATE_PROXY_USER_AGENT";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "User-Agent header for proxied requests";

        fn parse(value: &str) -> EnvResult<String> {
            let agent = value.trim();
            if agent.is_empty() {
                return Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: "User agent must not be empty".to_string(),
                });
            }
            Ok(agent.to_string())
        }
    }
}

/// 翻译历史相关环境变量
pub mod history {
    use super::*;

    /// 启动时保留的最大翻译条目数
    pub struct MaxEntries;
    impl EnvVar<usize> for MaxEntries {
        const NAME: &'static str = "XTRANSLATE_HISTORY_MAX_ENTRIES";
        const DEFAULT: Option<usize> = None;
        const DESCRIPTION: &'static str =
            "Trim translation history to this many entries at startup";

        fn parse(value: &str) -> EnvResult<usize> {
            parse_positive_usize(value, Self::NAME, 1, 1_000_000)
        }
    }
}

fn parse_seconds(value: &str, var_name: &str, min: u64, max: u64) -> EnvResult<Duration> {
    let seconds: u64 = value.trim().parse().map_err(|_| EnvError {
        variable: var_name.to_string(),
        message: "Must be a valid number of seconds".to_string(),
    })?;

    if seconds < min {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} is below minimum {}", seconds, min),
        });
    }

    if seconds > max {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} exceeds maximum {}", seconds, max),
        });
    }

    Ok(Duration::from_secs(seconds))
}

fn parse_positive_usize(value: &str, var_name: &str, min: usize, max: usize) -> EnvResult<usize> {
    let num: usize = value.trim().parse().map_err(|_| EnvError {
        variable: var_name.to_string(),
        message: "Must be a valid positive number".to_string(),
    })?;

    if num < min {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} is below minimum {}", num, min),
        });
    }

    if num > max {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: format!("Value {} exceeds maximum {}", num, max),
        });
    }

    Ok(num)
}

/// 环境变量文档生成器
pub fn generate_env_docs() -> String {
    let mut docs = String::new();
    docs.push_str("# Environment Variables\n\n");

    let entries: [(&str, &str); 7] = [
        (core::Mode::NAME, core::Mode::DESCRIPTION),
        (core::LogLevel::NAME, core::LogLevel::DESCRIPTION),
        (storage::Dir::NAME, storage::Dir::DESCRIPTION),
        (bus::RequestTimeout::NAME, bus::RequestTimeout::DESCRIPTION),
        (proxy::Timeout::NAME, proxy::Timeout::DESCRIPTION),
        (proxy::UserAgent::NAME, proxy::UserAgent::DESCRIPTION),
        (history::MaxEntries::NAME, history::MaxEntries::DESCRIPTION),
    ];
    for (name, description) in entries {
        docs.push_str(&format!("- `{}`: {}\n", name, description));
    }

    docs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_mode_parsing() {
        assert_eq!(core::Mode::parse("development").unwrap(), "development");
        assert_eq!(core::Mode::parse("PROD").unwrap(), "production");
        assert!(core::Mode::parse("staging").is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(core::LogLevel::parse(" DEBUG ").unwrap(), "debug");
        assert!(core::LogLevel::parse("verbose").is_err());
    }

    #[test]
    fn test_seconds_validation() {
        assert_eq!(
            bus::RequestTimeout::parse("0").unwrap(),
            Duration::from_secs(0)
        );
        assert_eq!(proxy::Timeout::parse("15").unwrap(), Duration::from_secs(15));
        assert!(proxy::Timeout::parse("0").is_err());
        assert!(proxy::Timeout::parse("10000").is_err());
        assert!(proxy::Timeout::parse("soon").is_err());
    }

    #[test]
    fn test_max_entries_validation() {
        assert_eq!(history::MaxEntries::parse("500").unwrap(), 500);
        assert!(history::MaxEntries::parse("0").is_err());
        assert!(history::MaxEntries::parse("-3").is_err());
    }

    #[test]
    fn test_env_docs_mention_every_variable() {
        let docs = generate_env_docs();
        assert!(docs.contains("XTRANSLATE_STORAGE_DIR"));
        assert!(docs.contains("XTRANSLATE_HISTORY_MAX_ENTRIES"));
        assert!(docs.contains("XTRANSLATE_PROXY_USER_AGENT"));
    }
}
