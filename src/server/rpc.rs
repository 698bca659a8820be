//! gRPC 服务器

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{debug, info};

use crate::config;
use crate::error::{Component, Error, Result};
use crate::mux::MuxListener;

use super::dispatch::Dispatch;

/// gRPC 传输参数
#[derive(Debug, Clone, Default)]
pub struct RpcServerConfig {
    pub max_concurrent_streams: Option<u32>,
    pub concurrency_limit_per_connection: Option<usize>,
    pub timeout: Option<Duration>,
}

impl From<&config::RpcConfig> for RpcServerConfig {
    fn from(config: &config::RpcConfig) -> Self {
        Self {
            max_concurrent_streams: config.max_concurrent_streams,
            concurrency_limit_per_connection: config.concurrency_limit_per_connection,
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// 服务于复用器 gRPC 子监听器的 tonic 服务器
pub struct RpcServer {
    config: RpcServerConfig,
    dispatch: Dispatch,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig, dispatch: Dispatch, shutdown: CancellationToken) -> Self {
        Self {
            config,
            dispatch,
            shutdown,
        }
    }

    /// 运行直到关闭令牌触发并且所有连接排空
    pub async fn serve(self, listener: MuxListener) -> Result<()> {
        let mut builder = Server::builder().max_concurrent_streams(self.config.max_concurrent_streams);
        if let Some(limit) = self.config.concurrency_limit_per_connection {
            builder = builder.concurrency_limit_per_connection(limit);
        }
        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }

        info!(address = %listener.local_addr(), "🚀 gRPC server listening");
        builder
            .serve_with_incoming_shutdown(
                self.dispatch,
                listener.into_incoming(),
                self.shutdown.cancelled_owned(),
            )
            .await
            .map_err(|e| Error::serve(Component::Rpc, e))?;
        debug!("gRPC server drained");
        Ok(())
    }
}
