//! 集成测试共享的测试服务与客户端工具

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use flare_service::interceptor::{Interceptor, Next, RpcRequest, RpcResponse};
use flare_service::utils::{dialable_address, wait_for_server_ready};
use flare_service::{LifecycleState, Service};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full, StreamBody};
use tokio::sync::Notify;
use tonic::server::NamedService;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tower::ServiceExt;

pub const SAY: &str = "/test.Echo/Say";
pub const HANG: &str = "/test.Echo/Hang";

/// 把 gRPC 消息原样返回的测试服务；`Hang` 方法永不返回
#[derive(Clone, Default)]
pub struct Echo {
    pub entered_hang: Arc<Notify>,
}

impl NamedService for Echo {
    const NAME: &'static str = "test.Echo";
}

impl tower::Service<http::Request<tonic::body::Body>> for Echo {
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<tonic::body::Body>) -> Self::Future {
        let entered_hang = self.entered_hang.clone();
        Box::pin(async move {
            let path = request.uri().path().to_string();
            match path.as_str() {
                SAY => {
                    let frame = match request.into_body().collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(status) => return Ok(status.into_http()),
                    };
                    Ok(grpc_response(frame))
                }
                HANG => {
                    entered_hang.notify_one();
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                _ => Ok(Status::unimplemented(path).into_http()),
            }
        })
    }
}

/// 数据帧 + `grpc-status: 0` trailers
fn grpc_response(frame: Bytes) -> http::Response<tonic::body::Body> {
    let mut trailers = http::HeaderMap::new();
    trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
    let frames = futures::stream::iter(vec![
        Ok::<_, Status>(http_body::Frame::data(frame)),
        Ok(http_body::Frame::trailers(trailers)),
    ]);
    http::Response::builder()
        .header("content-type", "application/grpc")
        .body(tonic::body::Body::new(StreamBody::new(frames)))
        .unwrap()
}

/// gRPC 长度前缀帧
pub fn grpc_frame(message: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(5 + message.len());
    frame.put_u8(0);
    frame.put_u32(message.len() as u32);
    frame.extend_from_slice(message);
    frame.freeze()
}

/// 通过真实 HTTP/2 连接发起一元调用，返回响应头与消息
pub async fn grpc_unary(
    channel: Channel,
    path: &str,
    message: &[u8],
) -> Result<(http::HeaderMap, Bytes), Status> {
    let request = http::Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(tonic::body::Body::new(Full::new(grpc_frame(message))))
        .unwrap();

    let response = channel
        .oneshot(request)
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;
    let headers = response.headers().clone();
    if let Some(status) = Status::from_header_map(&headers) {
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
    let data = collected.to_bytes();
    Ok((headers, data.slice(5..)))
}

pub async fn connect(service: &Service) -> Channel {
    let addr = dialable_address(service.local_addr().expect("service is bound"));
    wait_for_server_ready(addr, Duration::from_secs(5))
        .await
        .expect("service accepts connections");
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("connect to service")
}

/// 等待服务进入运行状态
pub async fn wait_running(service: &Service) {
    let mut state = service.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == LifecycleState::Running),
    )
    .await
    .expect("service did not reach Running")
    .expect("state channel closed");
}

/// 后台启动服务
pub fn spawn_start(service: &Service) -> tokio::task::JoinHandle<flare_service::Result<()>> {
    let service = service.clone();
    tokio::spawn(async move { service.start().await })
}

/// 记录请求与响应经过顺序的拦截器
pub struct Recorder {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl Interceptor for Recorder {
    async fn intercept(&self, request: RpcRequest, next: Next) -> RpcResponse {
        self.log.lock().unwrap().push(format!("{}:request", self.name));
        let response = next.run(request).await;
        self.log.lock().unwrap().push(format!("{}:response", self.name));
        response
    }
}
