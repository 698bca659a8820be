use async_trait::async_trait;
use http::HeaderValue;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::{Interceptor, Next, RpcRequest, RpcResponse, extract_trace_info};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// 追踪拦截器
///
/// 为每个调用建立一个 span，携带 `x-trace-id` 与 `x-request-id`；
/// 请求没有 `x-request-id` 时生成一个，并在响应中回传。
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for TracingInterceptor {
    async fn intercept(&self, mut request: RpcRequest, next: Next) -> RpcResponse {
        let mut trace = extract_trace_info(request.headers()).unwrap_or_default();
        if trace.request_id.is_empty() {
            trace.request_id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&trace.request_id) {
                request.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
        }

        let span = info_span!(
            "grpc_request",
            method = %request.uri().path(),
            trace_id = %trace.trace_id,
            request_id = %trace.request_id,
        );

        let mut response = next.run(request).instrument(span).await;
        if let Ok(value) = HeaderValue::from_str(&trace.request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}
