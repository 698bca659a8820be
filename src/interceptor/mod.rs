//! gRPC 拦截器模块
//!
//! 拦截器工作在 HTTP 层：接收 `http::Request<tonic::body::Body>` 和 [`Next`]，
//! 返回 `http::Response<tonic::body::Body>`。同一条拦截器链同时装饰网络
//! 服务器和进程内调度通道，两条路径观察到的顺序完全一致。

pub mod auth;
pub mod chain;
pub mod logging;
pub mod metadata;
pub mod tracing;

pub use auth::{BearerToken, StaticTokenValidator, TokenAuthInterceptor, TokenValidator};
pub use chain::{CallKind, InterceptorChain, Next};
pub use logging::LoggingInterceptor;
pub use metadata::MetadataInterceptor;
pub use self::tracing::TracingInterceptor;

use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

/// 拦截器看到的请求
pub type RpcRequest = http::Request<tonic::body::Body>;

/// 拦截器返回的响应
pub type RpcResponse = http::Response<tonic::body::Body>;

/// 拦截器
///
/// 调用 `next.run(request)` 继续执行链条；直接返回响应即可短路调用。
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, request: RpcRequest, next: Next) -> RpcResponse;
}

/// 共享的拦截器句柄
pub type SharedInterceptor = Arc<dyn Interceptor>;

/// 将 gRPC 状态转换为 trailers-only 响应
pub fn status_response(status: Status) -> RpcResponse {
    status.into_http()
}

/// 追踪信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInfo {
    pub trace_id: String,
    pub request_id: String,
}

/// 从请求头中提取追踪信息
pub fn extract_trace_info(headers: &http::HeaderMap) -> Option<TraceInfo> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let trace_id = header("x-trace-id");
    let request_id = header("x-request-id");

    if trace_id.is_empty() && request_id.is_empty() {
        return None;
    }

    Some(TraceInfo {
        trace_id,
        request_id,
    })
}
