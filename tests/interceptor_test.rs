//! 拦截器链在网络路径与进程内路径上的一致性

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use flare_service::interceptor::{
    Interceptor, Next, RpcRequest, RpcResponse, StaticTokenValidator, TokenAuthInterceptor, status_response,
};
use flare_service::{ManualSignals, Options, Service};
use tonic::{Code, Status};

use common::{Echo, Recorder, SAY, connect, grpc_unary, spawn_start, wait_running};

fn take(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    std::mem::take(&mut *log.lock().unwrap())
}

#[tokio::test]
async fn network_and_in_process_calls_share_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let service = Service::new(
        Options::new("ordered")
            .with_address("127.0.0.1:0")
            .with_signals(ManualSignals::new())
            .with_interceptor(Recorder::new("a", &log))
            .with_interceptor(Recorder::new("b", &log)),
    )
    .unwrap();
    service.register_service(Echo::default());

    let running = spawn_start(&service);
    wait_running(&service).await;

    let expected = vec!["a:request", "b:request", "b:response", "a:response"];

    let channel = connect(&service).await;
    let (_, message) = grpc_unary(channel, SAY, b"over the wire").await.unwrap();
    assert_eq!(&message[..], b"over the wire");
    assert_eq!(take(&log), expected);

    let message = service
        .in_process_channel()
        .unary_bytes(SAY, Bytes::from_static(b"in process"))
        .await
        .unwrap();
    assert_eq!(&message[..], b"in process");
    assert_eq!(take(&log), expected);

    service.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn streaming_services_use_stream_chain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let service = Service::new(
        Options::new("streams")
            .with_signals(ManualSignals::new())
            .with_unary_interceptor(Recorder::new("unary", &log))
            .with_stream_interceptor(Recorder::new("stream", &log)),
    )
    .unwrap();
    service.register_streaming_service(Echo::default());

    service
        .in_process_channel()
        .unary_bytes(SAY, Bytes::from_static(b"ping"))
        .await
        .unwrap();
    assert_eq!(take(&log), vec!["stream:request", "stream:response"]);
}

struct Deny;

#[async_trait]
impl Interceptor for Deny {
    async fn intercept(&self, _request: RpcRequest, _next: Next) -> RpcResponse {
        status_response(Status::permission_denied("closed for maintenance"))
    }
}

#[tokio::test]
async fn short_circuit_is_seen_by_both_paths() {
    let service = Service::new(
        Options::new("denied")
            .with_address("127.0.0.1:0")
            .with_signals(ManualSignals::new())
            .with_interceptor(Deny),
    )
    .unwrap();
    service.register_service(Echo::default());

    let running = spawn_start(&service);
    wait_running(&service).await;

    let channel = connect(&service).await;
    let err = grpc_unary(channel, SAY, b"x").await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = service
        .in_process_channel()
        .unary_bytes(SAY, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    service.stop().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn bearer_token_is_required() {
    let validator = Arc::new(StaticTokenValidator::new(["secret"]));
    let service = Service::new(
        Options::new("auth")
            .with_signals(ManualSignals::new())
            .with_interceptor(TokenAuthInterceptor::new(validator)),
    )
    .unwrap();
    service.register_service(Echo::default());
    let channel = service.in_process_channel();

    let err = channel
        .unary_bytes(SAY, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let mut headers = http::HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let message = channel
        .unary_bytes_with_headers(SAY, Bytes::from_static(b"x"), headers)
        .await
        .unwrap();
    assert_eq!(&message[..], b"x");
}
