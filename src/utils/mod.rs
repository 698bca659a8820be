//! 工具函数

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::{BoxError, Error, Result};

/// 补全监听地址：host 为空时监听所有网卡
///
/// `":8080"` → `"0.0.0.0:8080"`，`"[::]:0"` 保持不变。
pub fn normalize_address(address: &str) -> Result<String> {
    let address = address.trim();
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(Error::configuration(format!(
            "invalid address {address:?}: expected host:port"
        )));
    };
    if port.parse::<u16>().is_err() {
        return Err(Error::configuration(format!(
            "invalid address {address:?}: bad port"
        )));
    }
    if host.is_empty() {
        Ok(format!("0.0.0.0:{port}"))
    } else {
        Ok(address.to_string())
    }
}

/// 将通配地址替换为回环地址，便于本机客户端连接
pub fn dialable_address(address: SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from(([127, 0, 0, 1], v4.port()))
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, v6.port()))
        }
        other => other,
    }
}

/// 等待服务可以接受 TCP 连接
///
/// 指数退避重试，直到连接成功或超过 `deadline`。
pub async fn wait_for_server_ready(address: SocketAddr, deadline: Duration) -> std::result::Result<(), BoxError> {
    const INITIAL_DELAY_MS: u64 = 10;
    const MAX_DELAY_MS: u64 = 500;

    let start = Instant::now();
    let mut delay_ms = INITIAL_DELAY_MS;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match timeout(Duration::from_millis(100), TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Server is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(address = %address, attempt, error = %e, "Connection attempt failed, retrying...");
            }
            Err(_) => {
                debug!(address = %address, attempt, "Connection attempt timed out, retrying...");
            }
        }

        if start.elapsed() >= deadline {
            return Err(format!("server at {address} not ready after {attempt} attempts").into());
        }
        sleep(Duration::from_millis(delay_ms)).await;
        delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
    }
}
