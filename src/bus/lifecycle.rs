//! 安装生命周期钩子

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

/// 安装原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "lowercase")]
pub enum InstallReason {
    /// 全新安装
    Install,
    /// 从旧版本更新
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_version: Option<String>,
    },
}

impl InstallReason {
    pub fn is_fresh_install(&self) -> bool {
        matches!(self, InstallReason::Install)
    }
}

impl fmt::Display for InstallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallReason::Install => f.write_str("install"),
            InstallReason::Update {
                previous_version: Some(version),
            } => write!(f, "update (from {})", version),
            InstallReason::Update {
                previous_version: None,
            } => f.write_str("update"),
        }
    }
}

/// 安装钩子，每个代理进程最多调用一次
pub trait InstallHook: Send + Sync + 'static {
    fn on_install(&self, reason: InstallReason) -> BoxFuture<'static, BrokerResult<()>>;
}

impl<F, Fut> InstallHook for F
where
    F: Fn(InstallReason) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = BrokerResult<()>> + Send + 'static,
{
    fn on_install(&self, reason: InstallReason) -> BoxFuture<'static, BrokerResult<()>> {
        Box::pin(self(reason))
    }
}
