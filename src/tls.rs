//! TLS 配置提供者
//!
//! 证书加载不在本 crate 的职责内，调用方提供构建好的 rustls `ServerConfig`。

use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;

use crate::error::{BoxError, Error, Result};

const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// 提供服务端 TLS 配置；返回 `None` 表示明文监听
pub trait TlsProvider: Send + Sync + 'static {
    fn server_config(&self) -> std::result::Result<Option<Arc<ServerConfig>>, BoxError>;
}

impl TlsProvider for Arc<ServerConfig> {
    fn server_config(&self) -> std::result::Result<Option<Arc<ServerConfig>>, BoxError> {
        Ok(Some(self.clone()))
    }
}

/// 从提供者构建 acceptor
///
/// 未设置 ALPN 时补上 `h2` 和 `http/1.1`，否则 HTTP/2 客户端无法协商。
pub(crate) fn acceptor(provider: &dyn TlsProvider) -> Result<Option<TlsAcceptor>> {
    let Some(config) = provider.server_config().map_err(Error::Tls)? else {
        return Ok(None);
    };

    let config = if config.alpn_protocols.is_empty() {
        let mut config = (*config).clone();
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    } else {
        config
    };
    Ok(Some(TlsAcceptor::from(config)))
}
