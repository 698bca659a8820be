use std::io;
use std::net::SocketAddr;

use futures::{Stream, StreamExt, stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::matcher::Protocol;
use super::stream::MuxedStream;

/// 派生监听器
///
/// 由多路复用器的接受循环投递连接。每个派生监听器只被一个服务循环独占。
#[derive(Debug)]
pub struct MuxListener {
    protocol: Protocol,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<MuxedStream>,
}

impl MuxListener {
    pub(crate) fn new(protocol: Protocol, local_addr: SocketAddr, rx: mpsc::Receiver<MuxedStream>) -> Self {
        Self {
            protocol,
            local_addr,
            rx,
        }
    }

    /// 该监听器接收的协议桶
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// 底层共享监听器的地址
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受下一个连接，多路复用器关闭后返回 `None`
    pub async fn accept(&mut self) -> Option<MuxedStream> {
        self.rx.recv().await
    }

    /// 转换为 tonic 所需的连接流
    ///
    /// 多路复用器关闭后流保持挂起而不是结束，服务器只由关闭信号终止。
    pub fn into_incoming(self) -> impl Stream<Item = io::Result<MuxedStream>> + Send + 'static {
        ReceiverStream::new(self.rx)
            .map(Ok)
            .chain(stream::pending())
    }
}

impl axum::serve::Listener for MuxListener {
    type Io = MuxedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(stream) => {
                let addr = stream.remote_addr().unwrap_or(self.local_addr);
                (stream, addr)
            }
            // 关闭后挂起，由 graceful shutdown 结束服务循环
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
