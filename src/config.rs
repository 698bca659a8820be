//! 配置文件
//!
//! TOML 格式，所有段落和字段都有默认值：
//!
//! ```toml
//! [service]
//! name = "greeter"
//! version = "1.0.0"
//! address = "0.0.0.0:8080"
//!
//! [rpc]
//! health = true
//! reflection = false
//!
//! [mux]
//! read_timeout_ms = 5000
//!
//! [http]
//! web_bridge = true
//! web_prefix = "/grpc-web"
//!
//! [logging]
//! format = "json"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogFormat;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub rpc: RpcConfig,
    pub mux: MuxConfig,
    pub http: HttpConfig,
    pub cors: CorsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    /// `host:port`，host 为空表示监听所有网卡
    pub address: String,
    pub metadata: HashMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            address: ":8080".to_string(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    pub health: bool,
    pub reflection: bool,
    pub max_concurrent_streams: Option<u32>,
    pub concurrency_limit_per_connection: Option<usize>,
    pub timeout_ms: Option<u64>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            health: true,
            reflection: false,
            max_concurrent_streams: None,
            concurrency_limit_per_connection: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MuxConfig {
    /// 协议探测的读超时
    pub read_timeout_ms: u64,
    /// 协议探测最多缓冲的字节数
    pub max_sniff_bytes: usize,
    pub tcp_nodelay: bool,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5_000,
            max_sniff_bytes: 64 * 1024,
            tcp_nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 启用 gRPC-Web 桥
    pub web_bridge: bool,
    /// gRPC-Web 挂载前缀，空表示根路径
    pub web_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// 空列表表示回显请求的 Origin
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
    /// 空列表表示回显请求的 Access-Control-Request-Headers
    pub allow_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origins: Vec::new(),
            allow_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD"]
                .into_iter()
                .map(String::from)
                .collect(),
            allow_headers: Vec::new(),
            allow_credentials: true,
            max_age_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::configuration(format!("invalid config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.mux.read_timeout_ms, 5_000);
        assert!(config.rpc.health);
        assert!(config.cors.allow_credentials);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [service]
            name = "greeter"
            version = "1.2.0"
            address = "127.0.0.1:0"

            [http]
            web_bridge = true
            web_prefix = "/grpc-web"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.service.name, "greeter");
        assert_eq!(config.service.address, "127.0.0.1:0");
        assert!(config.http.web_bridge);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.mux.max_sniff_bytes, 64 * 1024);
    }

    #[test]
    fn malformed_document_is_configuration_error() {
        let err = Config::from_toml("[service\nname=").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
