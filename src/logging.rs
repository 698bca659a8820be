//! 日志初始化
//!
//! 基于 `tracing-subscriber`：`RUST_LOG` 环境变量优先，缺省使用配置中的级别。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt, prelude::*};

use crate::error::{Error, Result};

/// 日志输出格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::configuration(format!("unknown log format: {other}"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        })
    }
}

/// 使用默认级别 `info` 初始化全局订阅者
pub fn init(format: LogFormat) -> Result<()> {
    init_with_filter(format, "info")
}

/// 使用自定义默认过滤器初始化全局订阅者
///
/// 全局订阅者只能安装一次，重复调用返回配置错误。
pub fn init_with_filter(format: LogFormat, default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| Error::configuration(format!("invalid log filter {default_filter:?}: {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry.with(tracing_fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(tracing_fmt::layer().json()).try_init(),
    };
    installed.map_err(|e| Error::configuration(format!("failed to install log subscriber: {e}")))
}
