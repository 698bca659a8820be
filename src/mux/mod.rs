//! 协议多路复用
//!
//! 在一个 TCP 监听器上同时承载 gRPC 与普通 HTTP：每个新连接在独立任务中
//! 经过（可选的）TLS 握手和有界的协议探测，然后被投递到 RPC 或 other
//! 派生监听器。探测读到的字节会在连接被服务器读取前原样回放。

mod listener;
pub mod matcher;
mod stream;

pub use listener::MuxListener;
pub use matcher::{Decision, GrpcMatcher, Protocol, ProtocolMatcher};
pub use stream::{MuxedStream, Transport};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config;

/// 单次读取的缓冲扩容步长
const SNIFF_CHUNK: usize = 4 * 1024;

/// 非连接类接受错误后的退避时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 多路复用器错误
#[derive(Error, Debug)]
pub enum MuxError {
    /// 监听器已关闭，正常关闭流程的一部分
    #[error("mux: server closed")]
    Closed,

    #[error("mux: accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// 多路复用器参数
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// 协议探测（含 TLS 握手）的总时限
    pub read_timeout: Duration,
    /// 探测阶段最多缓冲的字节数，超过后归入 other
    pub max_sniff_bytes: usize,
    pub tcp_nodelay: bool,
    /// 每个派生监听器的待接受队列长度
    pub backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            max_sniff_bytes: 64 * 1024,
            tcp_nodelay: true,
            backlog: 128,
        }
    }
}

impl From<&config::MuxConfig> for MuxConfig {
    fn from(config: &config::MuxConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            max_sniff_bytes: config.max_sniff_bytes,
            tcp_nodelay: config.tcp_nodelay,
            ..Self::default()
        }
    }
}

/// 协议多路复用器
pub struct ProtocolMux {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: MuxConfig,
    matcher: Arc<dyn ProtocolMatcher>,
    tls: Option<TlsAcceptor>,
    abort: CancellationToken,
    tracker: TaskTracker,
    rpc_tx: mpsc::Sender<MuxedStream>,
    other_tx: mpsc::Sender<MuxedStream>,
    rpc: Option<MuxListener>,
    other: Option<MuxListener>,
}

impl ProtocolMux {
    /// 包装一个已绑定的监听器
    pub fn new(listener: TcpListener, config: MuxConfig) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let backlog = config.backlog.max(1);
        let (rpc_tx, rpc_rx) = mpsc::channel(backlog);
        let (other_tx, other_rx) = mpsc::channel(backlog);

        Ok(Self {
            listener,
            local_addr,
            config,
            matcher: Arc::new(GrpcMatcher),
            tls: None,
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
            rpc_tx,
            other_tx,
            rpc: Some(MuxListener::new(Protocol::Rpc, local_addr, rpc_rx)),
            other: Some(MuxListener::new(Protocol::Other, local_addr, other_rx)),
        })
    }

    /// 在探测前完成 TLS 握手
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// 替换协议探测器
    pub fn with_matcher(mut self, matcher: Arc<dyn ProtocolMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// 强制停止令牌，取消后所有已分流连接的读写立即失败
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// 分类任务使用的任务跟踪器
    pub fn with_tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 取出 RPC 派生监听器（只能取一次）
    pub fn rpc_listener(&mut self) -> Option<MuxListener> {
        self.rpc.take()
    }

    /// 取出 other 派生监听器（只能取一次）
    pub fn other_listener(&mut self) -> Option<MuxListener> {
        self.other.take()
    }

    /// 运行接受循环，直到 `shutdown` 被取消
    ///
    /// 返回时底层监听器已关闭；正常关闭返回 [`MuxError::Closed`]。
    /// 未被取出的派生监听器在此丢弃，投递给它的连接会被关闭。
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), MuxError> {
        let ProtocolMux {
            listener,
            local_addr,
            config,
            matcher,
            tls,
            abort,
            tracker,
            rpc_tx,
            other_tx,
            rpc,
            other,
        } = self;
        drop(rpc);
        drop(other);

        let router = Arc::new(ConnectionRouter {
            config,
            matcher,
            tls,
            abort,
            shutdown: shutdown.clone(),
            rpc_tx,
            other_tx,
        });

        info!(address = %local_addr, tls = router.tls.is_some(), "🔀 Protocol mux accepting connections");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, remote_addr)) => {
                    let router = router.clone();
                    tracker.spawn(async move { router.route(socket, remote_addr).await });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection failed before accept");
                }
                Err(e) if is_resource_exhausted(&e) => {
                    warn!(error = %e, "Accept failed, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!(address = %local_addr, error = %e, "❌ Protocol mux accept failed");
                    return Err(MuxError::Accept(e));
                }
            }
        }

        drop(listener);
        debug!(address = %local_addr, "Protocol mux listener closed");
        Err(MuxError::Closed)
    }
}

/// 单个连接的分流逻辑，由所有分类任务共享
struct ConnectionRouter {
    config: MuxConfig,
    matcher: Arc<dyn ProtocolMatcher>,
    tls: Option<TlsAcceptor>,
    abort: CancellationToken,
    shutdown: CancellationToken,
    rpc_tx: mpsc::Sender<MuxedStream>,
    other_tx: mpsc::Sender<MuxedStream>,
}

impl ConnectionRouter {
    async fn route(&self, socket: TcpStream, remote_addr: SocketAddr) {
        tokio::select! {
            _ = self.classify_and_deliver(socket, remote_addr) => {}
            _ = self.shutdown.cancelled() => {
                debug!(%remote_addr, "Dropping unclassified connection on shutdown");
            }
        }
    }

    async fn classify_and_deliver(&self, socket: TcpStream, remote_addr: SocketAddr) {
        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                debug!(%remote_addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }
        let local_addr = socket.local_addr().ok();
        let deadline = Instant::now() + self.config.read_timeout;

        let mut transport = match &self.tls {
            None => Transport::Plain(socket),
            Some(acceptor) => match timeout_at(deadline, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => Transport::Tls(Box::new(stream)),
                Ok(Err(e)) => {
                    debug!(%remote_addr, error = %e, "TLS handshake failed, closing connection");
                    return;
                }
                Err(_) => {
                    debug!(%remote_addr, "TLS handshake timed out, closing connection");
                    return;
                }
            },
        };

        let (protocol, sniffed) = self.sniff(&mut transport, deadline, remote_addr).await;
        debug!(%remote_addr, protocol = protocol.as_str(), sniffed = sniffed.len(), "Connection classified");

        let stream = MuxedStream::new(
            transport,
            sniffed,
            self.abort.child_token(),
            local_addr,
            Some(remote_addr),
        );
        let tx = match protocol {
            Protocol::Rpc => &self.rpc_tx,
            Protocol::Other => &self.other_tx,
        };
        if tx.send(stream).await.is_err() {
            debug!(%remote_addr, protocol = protocol.as_str(), "No server for connection, closing it");
        }
    }

    /// 读取直到探测器给出结论；超时、EOF、读错误或超出上限时归入 other
    async fn sniff(&self, transport: &mut Transport, deadline: Instant, remote_addr: SocketAddr) -> (Protocol, Bytes) {
        let mut buf = BytesMut::with_capacity(SNIFF_CHUNK);
        loop {
            if let Decision::Matched(protocol) = self.matcher.classify(&buf) {
                return (protocol, buf.freeze());
            }
            if buf.len() >= self.config.max_sniff_bytes {
                debug!(%remote_addr, limit = self.config.max_sniff_bytes, "Sniff limit reached");
                return (Protocol::Other, buf.freeze());
            }
            buf.reserve(SNIFF_CHUNK);

            match timeout_at(deadline, transport.read_buf(&mut buf)).await {
                Ok(Ok(0)) => return (Protocol::Other, buf.freeze()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(%remote_addr, error = %e, "Read failed during sniffing");
                    return (Protocol::Other, buf.freeze());
                }
                Err(_) => {
                    debug!(%remote_addr, "Protocol sniffing timed out");
                    return (Protocol::Other, buf.freeze());
                }
            }
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

/// EMFILE / ENFILE / ENOBUFS / ENOMEM
fn is_resource_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(12 | 23 | 24 | 105))
        || matches!(e.kind(), io::ErrorKind::OutOfMemory)
}
