//! 终止信号源
//!
//! 运行时在启动阶段订阅信号源：第一个信号触发优雅停止，第二个信号强制停止。
//! 信号源被抽象为 [`SignalSource`]，测试中使用 [`ManualSignals`] 注入信号，
//! 不依赖进程级信号。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 订阅缓冲区容量
pub const SUBSCRIPTION_BUFFER: usize = 2;

/// 终止信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGQUIT
    Quit,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Interrupt => "interrupt",
            Signal::Quit => "quit",
        })
    }
}

/// 信号源
pub trait SignalSource: Send + Sync + 'static {
    /// 订阅终止信号，返回的订阅在 drop 时自动注销
    fn subscribe(&self) -> Subscription;
}

/// 信号订阅
pub struct Subscription {
    rx: mpsc::Receiver<Signal>,
    _guard: Box<dyn Any + Send + Sync>,
}

impl Subscription {
    /// 由接收端与注销守卫构造订阅
    pub fn new(rx: mpsc::Receiver<Signal>, guard: impl Any + Send + Sync) -> Self {
        Self {
            rx,
            _guard: Box::new(guard),
        }
    }

    /// 等待下一个信号，信号源关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }

    /// 显式注销
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// 进程信号源（SIGINT、SIGQUIT；非 Unix 平台为 Ctrl+C）
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSignals;

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SignalSource for OsSignals {
    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(forward_os_signals(tx));
        Subscription::new(rx, AbortOnDrop(task))
    }
}

#[cfg(unix)]
async fn forward_os_signals(tx: mpsc::Sender<Signal>) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut interrupt, mut quit) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::quit())) {
            (Ok(interrupt), Ok(quit)) => (interrupt, quit),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

    loop {
        let signal = tokio::select! {
            Some(()) = interrupt.recv() => Signal::Interrupt,
            Some(()) = quit.recv() => Signal::Quit,
            else => break,
        };
        if !deliver(&tx, signal) {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn forward_os_signals(tx: mpsc::Sender<Signal>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if !deliver(&tx, Signal::Interrupt) {
            break;
        }
    }
}

/// 非阻塞投递；缓冲区满时丢弃信号。返回订阅是否仍然存活
fn deliver(tx: &mpsc::Sender<Signal>, signal: Signal) -> bool {
    match tx.try_send(signal) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(%signal, "Signal buffer full, dropping signal");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// 手动信号源，用于测试和嵌入场景
#[derive(Clone, Default)]
pub struct ManualSignals {
    inner: Arc<ManualInner>,
}

#[derive(Default)]
struct ManualInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Signal>>>,
}

struct ManualGuard {
    inner: Arc<ManualInner>,
    id: u64,
}

impl Drop for ManualGuard {
    fn drop(&mut self) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl ManualSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// 向所有订阅者投递信号，返回成功投递的订阅数
    pub fn raise(&self, signal: Signal) -> usize {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers
            .values()
            .filter(|tx| tx.try_send(signal).is_ok())
            .count()
    }

    /// 当前订阅数
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for ManualSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualSignals")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl SignalSource for ManualSignals {
    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        Subscription::new(
            rx,
            ManualGuard {
                inner: self.inner.clone(),
                id,
            },
        )
    }
}
