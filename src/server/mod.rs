//! RPC 与 HTTP 服务端
//!
//! 两个服务器分别消费复用器的一个子监听器，共享同一组关闭令牌：
//! `shutdown` 触发优雅停止，`abort` 中断所有连接。

pub mod bridge;
pub mod dispatch;
pub mod http;
pub mod rpc;

pub use bridge::{GatewayBridge, GrpcWebBridge, RpcHandle, WebBridge, WebHandler};
pub use dispatch::{Dispatch, InProcessChannel, ServiceTable};
pub use http::{HttpMiddleware, HttpServer, cors_layer};
pub use rpc::{RpcServer, RpcServerConfig};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 服务器停止句柄
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 传给服务器与复用器的优雅停止令牌
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 传给复用器的强制停止令牌，每个连接持有它的子令牌
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// 停止接受新连接，等待进行中的调用结束
    pub fn graceful_stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("🛑 Gracefully stopping servers");
            self.shutdown.cancel();
        }
    }

    /// 立即中断所有连接
    pub fn stop(&self) {
        self.shutdown.cancel();
        if !self.abort.is_cancelled() {
            warn!("⚠️ Aborting all connections");
            self.abort.cancel();
        }
    }
}
