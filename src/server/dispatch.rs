//! 服务表、调度器与进程内通道

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::{Code, Status};
use tower::{Service, ServiceExt};

use crate::interceptor::{CallKind, InterceptorChain, RpcRequest, RpcResponse};

const GRPC_FRAME_HEADER_LEN: usize = 5;

/// 已注册的 RPC 服务
///
/// 网络服务器与进程内通道共享同一张表，注册后两条路径立即可见。
#[derive(Clone, Default)]
pub struct ServiceTable {
    inner: Arc<RwLock<TableState>>,
}

#[derive(Default)]
struct TableState {
    routes: Routes,
    services: Vec<String>,
    streaming_services: HashSet<String>,
    streaming_methods: HashSet<String>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务；`kind` 决定该服务所有方法使用哪条拦截器链
    pub fn add<S>(&self, svc: S, kind: CallKind)
    where
        S: Service<http::Request<tonic::body::Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let routes = std::mem::take(&mut state.routes);
        state.routes = routes.add_service(svc);
        state.services.push(S::NAME.to_string());
        if kind == CallKind::Streaming {
            state.streaming_services.insert(S::NAME.to_string());
        }
    }

    /// 将单个方法（`/package.Service/Method`）声明为流式
    pub fn mark_streaming_method(&self, path: impl Into<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .streaming_methods
            .insert(path.into());
    }

    /// 当前路由表的快照
    pub fn routes(&self) -> Routes {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .routes
            .clone()
    }

    /// 已注册的服务名，按注册顺序
    pub fn service_names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .iter()
            .any(|s| s == name)
    }

    /// 按请求路径判断调用类型
    pub fn call_kind(&self, path: &str) -> CallKind {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if state.streaming_methods.contains(path) {
            return CallKind::Streaming;
        }
        let service = path.trim_start_matches('/').split('/').next().unwrap_or_default();
        if state.streaming_services.contains(service) {
            CallKind::Streaming
        } else {
            CallKind::Unary
        }
    }
}

impl fmt::Debug for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTable")
            .field("services", &self.service_names())
            .finish()
    }
}

/// 拦截器链 + 服务表
///
/// 网络服务器和进程内通道都通过它进入已注册的服务。
#[derive(Clone, Debug)]
pub struct Dispatch {
    chain: InterceptorChain,
    table: ServiceTable,
}

impl Dispatch {
    pub fn new(chain: InterceptorChain, table: ServiceTable) -> Self {
        Self { chain, table }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn table(&self) -> &ServiceTable {
        &self.table
    }
}

impl Service<RpcRequest> for Dispatch {
    type Response = RpcResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<RpcResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RpcRequest) -> Self::Future {
        let kind = self.table.call_kind(request.uri().path());
        let routes = self.table.routes();
        let chain = self.chain.clone();
        Box::pin(async move { Ok(chain.call(kind, request, routes).await) })
    }
}

/// 进程内调度通道
///
/// 不经过网络直接调用已注册的服务，并经过与网络路径相同的拦截器链。
/// 实现了 `tower::Service`，可以直接交给 tonic 生成的客户端使用。
#[derive(Clone, Debug)]
pub struct InProcessChannel {
    dispatch: Dispatch,
}

impl InProcessChannel {
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// 以原始字节调用一元方法，`message` 为已编码的请求消息
    pub async fn unary_bytes(&self, path: &str, message: Bytes) -> Result<Bytes, Status> {
        self.unary_bytes_with_headers(path, message, http::HeaderMap::new())
            .await
    }

    /// 同 [`unary_bytes`](Self::unary_bytes)，附带请求元数据
    pub async fn unary_bytes_with_headers(
        &self,
        path: &str,
        message: Bytes,
        headers: http::HeaderMap,
    ) -> Result<Bytes, Status> {
        let len = u32::try_from(message.len())
            .map_err(|_| Status::resource_exhausted("message too large"))?;
        let mut frame = BytesMut::with_capacity(GRPC_FRAME_HEADER_LEN + message.len());
        frame.put_u8(0);
        frame.put_u32(len);
        frame.extend_from_slice(&message);

        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/grpc")
            .header(http::header::TE, "trailers")
            .body(tonic::body::Body::new(Full::new(frame.freeze())))
            .map_err(|e| Status::invalid_argument(format!("invalid request: {e}")))?;
        request.headers_mut().extend(headers);

        let response = match self.dispatch.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        if let Some(status) = Status::from_header_map(response.headers()) {
            if status.code() != Code::Ok {
                return Err(status);
            }
        }

        let collected = response.into_body().collect().await?;
        if let Some(status) = collected.trailers().and_then(Status::from_header_map) {
            if status.code() != Code::Ok {
                return Err(status);
            }
        }
        decode_frame(collected.to_bytes())
    }
}

fn decode_frame(mut data: Bytes) -> Result<Bytes, Status> {
    if data.len() < GRPC_FRAME_HEADER_LEN {
        return Err(Status::internal("missing response message"));
    }
    if data.get_u8() != 0 {
        return Err(Status::unimplemented("compressed responses are not supported"));
    }
    let len = data.get_u32() as usize;
    if data.len() < len {
        return Err(Status::internal("truncated response message"));
    }
    Ok(data.split_to(len))
}

impl<B> Service<http::Request<B>> for InProcessChannel
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<tonic::codegen::StdError>,
{
    type Response = RpcResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<RpcResponse, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        self.dispatch.call(request.map(tonic::body::Body::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_kind_by_service_and_method() {
        let table = ServiceTable::new();
        table.mark_streaming_method("/grpc.health.v1.Health/Watch");
        assert_eq!(table.call_kind("/grpc.health.v1.Health/Watch"), CallKind::Streaming);
        assert_eq!(table.call_kind("/grpc.health.v1.Health/Check"), CallKind::Unary);
        assert_eq!(table.call_kind("/unknown.Service/Method"), CallKind::Unary);
    }

    #[test]
    fn decodes_single_frame() {
        let frame = Bytes::from_static(&[0, 0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(decode_frame(frame).unwrap(), Bytes::from_static(b"abc"));
        assert!(decode_frame(Bytes::from_static(&[0, 0, 0])).is_err());
        assert!(decode_frame(Bytes::from_static(&[1, 0, 0, 0, 0])).is_err());
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let channel = InProcessChannel::new(Dispatch::new(InterceptorChain::default(), ServiceTable::new()));
        let err = channel
            .unary_bytes("/missing.Service/Call", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
