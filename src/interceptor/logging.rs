use std::time::Instant;

use async_trait::async_trait;
use tonic::Status;
use tracing::{info, warn};

use super::{Interceptor, Next, RpcRequest, RpcResponse};

/// 日志拦截器
///
/// 记录方法、耗时以及可见的 gRPC 状态。正常响应的状态位于 trailers 中，
/// 此处只能看到 trailers-only 响应（错误）的状态。
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept(&self, request: RpcRequest, next: Next) -> RpcResponse {
        let method = request.uri().path().to_string();
        let start = Instant::now();

        let response = next.run(request).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match Status::from_header_map(response.headers()) {
            Some(status) if status.code() != tonic::Code::Ok => warn!(
                %method,
                code = ?status.code(),
                message = %status.message(),
                elapsed_ms,
                "gRPC request failed"
            ),
            _ => info!(%method, elapsed_ms, "gRPC request"),
        }
        response
    }
}
