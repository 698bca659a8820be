use std::fmt;
use std::sync::Arc;

use tonic::service::Routes;
use tower::ServiceExt;

use super::{RpcRequest, RpcResponse, SharedInterceptor};

/// 调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    Streaming,
}

/// 拦截器链中剩余的部分
///
/// 链条末端是已注册服务的路由表。
pub struct Next {
    interceptors: Arc<[SharedInterceptor]>,
    position: usize,
    endpoint: Routes,
}

impl Next {
    pub(crate) fn new(interceptors: Arc<[SharedInterceptor]>, endpoint: Routes) -> Self {
        Self {
            interceptors,
            position: 0,
            endpoint,
        }
    }

    /// 将请求交给下一个拦截器（或最终的服务）
    pub async fn run(mut self, request: RpcRequest) -> RpcResponse {
        match self.interceptors.get(self.position).cloned() {
            Some(interceptor) => {
                self.position += 1;
                interceptor.intercept(request, self).await
            }
            None => match self.endpoint.oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            },
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.interceptors.len() - self.position))
            .finish()
    }
}

/// 不可变的拦截器链
///
/// 一元与流式调用各有一个有序列表，列表中的第一个拦截器最先看到请求、
/// 最后看到响应。克隆只复制引用计数。
#[derive(Clone, Default)]
pub struct InterceptorChain {
    unary: Arc<[SharedInterceptor]>,
    stream: Arc<[SharedInterceptor]>,
}

impl InterceptorChain {
    pub fn new(unary: Vec<SharedInterceptor>, stream: Vec<SharedInterceptor>) -> Self {
        Self {
            unary: unary.into(),
            stream: stream.into(),
        }
    }

    /// 一元调用入口
    pub fn unary(&self) -> &[SharedInterceptor] {
        &self.unary
    }

    /// 流式调用入口
    pub fn stream(&self) -> &[SharedInterceptor] {
        &self.stream
    }

    /// 经由对应的拦截器列表调用 `endpoint`
    pub async fn call(&self, kind: CallKind, request: RpcRequest, endpoint: Routes) -> RpcResponse {
        let interceptors = match kind {
            CallKind::Unary => self.unary.clone(),
            CallKind::Streaming => self.stream.clone(),
        };
        Next::new(interceptors, endpoint).run(request).await
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("unary", &self.unary.len())
            .field("stream", &self.stream.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{Interceptor, status_response};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tonic::Status;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
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

    struct Deny;

    #[async_trait]
    impl Interceptor for Deny {
        async fn intercept(&self, _request: RpcRequest, _next: Next) -> RpcResponse {
            status_response(Status::permission_denied("denied"))
        }
    }

    fn request(path: &str) -> RpcRequest {
        http::Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/grpc")
            .body(tonic::body::Body::empty())
            .unwrap()
    }

    fn grpc_status(response: &RpcResponse) -> Option<tonic::Code> {
        Status::from_header_map(response.headers()).map(|s| s.code())
    }

    #[tokio::test]
    async fn first_interceptor_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: SharedInterceptor = Arc::new(Recorder { name: "a", log: log.clone() });
        let b: SharedInterceptor = Arc::new(Recorder { name: "b", log: log.clone() });
        let chain = InterceptorChain::new(vec![a, b], Vec::new());

        // 空路由表对任何方法都返回 unimplemented
        let response = chain
            .call(CallKind::Unary, request("/test.Echo/Say"), Routes::default())
            .await;
        assert_eq!(grpc_status(&response), Some(tonic::Code::Unimplemented));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request", "b:request", "b:response", "a:response"]
        );
    }

    #[tokio::test]
    async fn streaming_calls_use_stream_list() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let unary: SharedInterceptor = Arc::new(Recorder { name: "unary", log: log.clone() });
        let stream: SharedInterceptor = Arc::new(Recorder { name: "stream", log: log.clone() });
        let chain = InterceptorChain::new(vec![unary], vec![stream]);

        chain
            .call(CallKind::Streaming, request("/test.Echo/Watch"), Routes::default())
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["stream:request", "stream:response"]);
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deny: SharedInterceptor = Arc::new(Deny);
        let after: SharedInterceptor = Arc::new(Recorder { name: "after", log: log.clone() });
        let chain = InterceptorChain::new(vec![deny, after], Vec::new());

        let response = chain
            .call(CallKind::Unary, request("/test.Echo/Say"), Routes::default())
            .await;
        assert_eq!(grpc_status(&response), Some(tonic::Code::PermissionDenied));
        assert!(log.lock().unwrap().is_empty());
    }
}
