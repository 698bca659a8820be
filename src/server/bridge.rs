//! HTTP 网关桥接与 gRPC-Web 桥接

use std::convert::Infallible;

use axum::Router;
use tower::util::BoxCloneSyncService;
use tower::{Layer, ServiceExt};
use tracing::debug;

use crate::error::BoxError;

use super::dispatch::{Dispatch, InProcessChannel};

/// gRPC-Web 桥接挂载到 HTTP 路由上的处理器
pub type WebHandler =
    BoxCloneSyncService<http::Request<axum::body::Body>, http::Response<axum::body::Body>, Infallible>;

/// HTTP → RPC 网关
///
/// 在服务构造时调用一次，把转换 HTTP 请求的处理器注册到路由上，
/// 处理器通过进程内通道调用 RPC 服务。
pub trait GatewayBridge: Send + Sync + 'static {
    fn register(&self, router: Router, channel: InProcessChannel) -> Result<Router, BoxError>;
}

impl<F> GatewayBridge for F
where
    F: Fn(Router, InProcessChannel) -> Result<Router, BoxError> + Send + Sync + 'static,
{
    fn register(&self, router: Router, channel: InProcessChannel) -> Result<Router, BoxError> {
        self(router, channel)
    }
}

/// 交给 Web 桥接的 RPC 服务器视图
#[derive(Clone, Debug)]
pub struct RpcHandle {
    dispatch: Dispatch,
}

impl RpcHandle {
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn service_names(&self) -> Vec<String> {
        self.dispatch.table().service_names()
    }
}

/// 浏览器 gRPC 桥接
pub trait WebBridge: Send + Sync + 'static {
    /// 包装 RPC 服务器，得到 HTTP 处理器
    fn wrap(&self, rpc: &RpcHandle) -> WebHandler;

    /// 需要转发到处理器的路径前缀，形如 `/package.Service/`
    fn list_resources(&self, rpc: &RpcHandle) -> Vec<String> {
        rpc.service_names()
            .into_iter()
            .map(|name| format!("/{name}/"))
            .collect()
    }
}

/// 基于 `tonic-web` 的默认桥接
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcWebBridge;

impl WebBridge for GrpcWebBridge {
    fn wrap(&self, rpc: &RpcHandle) -> WebHandler {
        let grpc_web = tonic_web::GrpcWebLayer::new().layer(rpc.dispatch().clone());
        let service = ServiceExt::<http::Request<axum::body::Body>>::map_response(
            grpc_web,
            |response: http::Response<tonic::body::Body>| response.map(axum::body::Body::new),
        );
        BoxCloneSyncService::new(service)
    }
}

/// 为每个资源前缀挂载处理器；前缀非空时先剥离再转发
pub(crate) fn mount_web(router: Router, bridge: &dyn WebBridge, rpc: &RpcHandle, prefix: &str) -> Router {
    let handler = bridge.wrap(rpc);
    let mut routes = Router::new();
    for resource in bridge.list_resources(rpc) {
        let resource = resource.trim_end_matches('/');
        debug!(resource = %resource, prefix = %prefix, "Mounting gRPC-Web resource");
        routes = routes.route_service(&format!("{resource}/{{*method}}"), handler.clone());
    }

    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        router.merge(routes)
    } else if prefix.starts_with('/') {
        router.nest(prefix, routes)
    } else {
        router.nest(&format!("/{prefix}"), routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{CallKind, InterceptorChain};
    use crate::server::dispatch::ServiceTable;

    #[test]
    fn resources_follow_registered_services() {
        let table = ServiceTable::new();
        let (_reporter, health) = tonic_health::server::health_reporter();
        table.add(health, CallKind::Unary);
        let rpc = RpcHandle::new(Dispatch::new(InterceptorChain::default(), table));

        assert_eq!(
            GrpcWebBridge.list_resources(&rpc),
            vec!["/grpc.health.v1.Health/".to_string()]
        );
    }

    #[tokio::test]
    async fn grpc_web_handler_serves_registered_service() {
        let table = ServiceTable::new();
        let (_reporter, health) = tonic_health::server::health_reporter();
        table.add(health, CallKind::Unary);
        let handler = GrpcWebBridge.wrap(&RpcHandle::new(Dispatch::new(InterceptorChain::default(), table)));

        let request = http::Request::builder()
            .method("POST")
            .uri("/grpc.health.v1.Health/Check")
            .header("content-type", "application/grpc-web+proto")
            .body(axum::body::Body::from(vec![0u8, 0, 0, 0, 0]))
            .unwrap();
        let response = handler.oneshot(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("application/grpc-web"));
    }

    #[test]
    fn gateway_closure_is_a_bridge() {
        let gateway = |router: Router, _channel: InProcessChannel| -> Result<Router, BoxError> {
            Ok(router.route("/v1/ping", axum::routing::get(|| async { "pong" })))
        };
        let channel = InProcessChannel::new(Dispatch::new(InterceptorChain::default(), ServiceTable::new()));
        assert!(gateway.register(Router::new(), channel).is_ok());
    }
}
