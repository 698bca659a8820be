//! 服务生命周期控制器
//!
//! [`Service`] 把一个 TCP 监听器、协议多路复用器、gRPC 服务器和 HTTP 服务器
//! 组装在一起，并驱动 `Idle → Starting → Running → Stopping → Stopped`
//! 状态机：
//!
//! - `start` 依次执行 before-start 钩子、挂载 gRPC-Web、绑定监听器、TLS、
//!   注册实例、启动三个服务循环、after-start 钩子，然后阻塞到服务停止；
//! - `stop` 幂等，拆除过程在独立任务中运行，丢弃 `stop` 的 future 不会中断拆除；
//! - 优雅停止期间收到第二个终止信号时强制中断所有连接；
//! - `close` 在 `stop` 的基础上等待拆除完成并关闭存储句柄。

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::server::NamedService;
use tonic_health::server::HealthReporter;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::error::{Component, Error, HookStage, Result};
use crate::health::HealthState;
use crate::interceptor::{CallKind, InterceptorChain, MetadataInterceptor, SharedInterceptor};
use crate::mux::ProtocolMux;
use crate::registry::{RegistrationGateway, RegistrationRecord};
use crate::server::bridge::mount_web;
use crate::server::http::assemble;
use crate::server::{
    Dispatch, HttpServer, InProcessChannel, RpcHandle, RpcServer, ServiceTable, StopHandle, cors_layer,
};
use crate::storage::Storage;
use crate::types::ServiceInstance;
use crate::utils::normalize_address;

use super::options::Options;
use super::state::{LifecycleState, StateCell};

/// 服务循环终止报告的通道容量（gRPC、HTTP、多路复用器各一个）
const SERVE_REPORT_CAPACITY: usize = 3;

/// 健康检查的流式方法
const HEALTH_WATCH_METHOD: &str = "/grpc.health.v1.Health/Watch";

/// 统一服务
///
/// 克隆只复制引用计数，所有克隆操作同一个实例。
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    options: Options,
    instance: RwLock<ServiceInstance>,
    local_addr: Mutex<Option<SocketAddr>>,
    prebound: Mutex<Option<std::net::TcpListener>>,
    state: StateCell,
    table: ServiceTable,
    dispatch: Dispatch,
    channel: InProcessChannel,
    health: Option<HealthState>,
    router: Router,
    /// 在取走调用方路由之前确定，`start` 据此决定是否启动 HTTP 服务器
    serves_http: bool,
    cors: Option<CorsLayer>,
    registration: RegistrationGateway,
    run: Mutex<Option<RunHandles>>,
    completion: Mutex<Option<CancellationToken>>,
    storage_closed: AtomicBool,
}

/// 运行期间持有的资源，由拆除任务消费
struct RunHandles {
    stop: StopHandle,
    tracker: TaskTracker,
    record: Option<RegistrationRecord>,
}

impl Service {
    /// 校验选项并构建服务
    ///
    /// 拦截器链、健康检查、反射服务与 HTTP 网关在这里一次性装配。
    pub fn new(mut options: Options) -> Result<Self> {
        options.validate()?;

        let instance = ServiceInstance::new(&options.name, &options.version, &options.address)
            .with_metadata(options.metadata.clone());

        // 版本在最外层，其次是服务名
        let mut prepended: Vec<SharedInterceptor> = Vec::new();
        if !options.version.is_empty() {
            prepended.push(Arc::new(MetadataInterceptor::service_version(&options.version)?));
        }
        prepended.push(Arc::new(MetadataInterceptor::service_name(&options.name)?));

        let unary = prepended
            .iter()
            .cloned()
            .chain(options.unary_interceptors.drain(..))
            .collect();
        let stream = prepended
            .into_iter()
            .chain(options.stream_interceptors.drain(..))
            .collect();
        let chain = InterceptorChain::new(unary, stream);

        let table = ServiceTable::new();
        let dispatch = Dispatch::new(chain, table.clone());
        let channel = InProcessChannel::new(dispatch.clone());

        let health = if options.health {
            let (state, server) = HealthState::new();
            table.add(server, CallKind::Unary);
            table.mark_streaming_method(HEALTH_WATCH_METHOD);
            Some(state)
        } else {
            None
        };

        if options.reflection {
            let mut builder = tonic_reflection::server::Builder::configure();
            for encoded in options.descriptor_sets.iter().copied() {
                builder = builder.register_encoded_file_descriptor_set(encoded);
            }
            let reflection = builder
                .build_v1()
                .map_err(|e| Error::configuration(format!("failed to build reflection service: {e}")))?;
            table.add(reflection, CallKind::Streaming);
        }

        let prebound = options.listener.take();
        let serves_http = options.serves_http();
        let mut router = options.http_router.take().unwrap_or_default();
        if let Some(gateway) = &options.gateway {
            router = gateway
                .register(router, channel.clone())
                .map_err(|e| Error::configuration(format!("gateway registration failed: {e}")))?;
            info!(service_name = %options.name, "Gateway bridge registered");
        }
        // validate 已检查过 CORS 配置
        let cors = options.cors.as_ref().map(cors_layer).transpose()?;
        let registration = RegistrationGateway::new(options.registry.clone());

        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            version = %instance.version,
            "Service created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                instance: RwLock::new(instance),
                local_addr: Mutex::new(None),
                prebound: Mutex::new(prebound),
                state: StateCell::new(),
                table,
                dispatch,
                channel,
                health,
                router,
                serves_http,
                cors,
                registration,
                run: Mutex::new(None),
                completion: Mutex::new(None),
                storage_closed: AtomicBool::new(false),
            }),
        })
    }

    /// 注册一元 RPC 服务，网络服务器和进程内通道同时可见
    pub fn register_service<S>(&self, service: S) -> &Self
    where
        S: tower::Service<http::Request<tonic::body::Body>, Error = std::convert::Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        self.add_service(service, CallKind::Unary)
    }

    /// 注册流式 RPC 服务，调用经过流式拦截器链
    pub fn register_streaming_service<S>(&self, service: S) -> &Self
    where
        S: tower::Service<http::Request<tonic::body::Body>, Error = std::convert::Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        self.add_service(service, CallKind::Streaming)
    }

    /// 将服务中的单个方法声明为流式，`path` 形如 `/package.Service/Method`
    pub fn mark_streaming_method(&self, path: impl Into<String>) -> &Self {
        self.inner.table.mark_streaming_method(path);
        self
    }

    fn add_service<S>(&self, service: S, kind: CallKind) -> &Self
    where
        S: tower::Service<http::Request<tonic::body::Body>, Error = std::convert::Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        let state = self.state();
        if state != LifecycleState::Idle {
            warn!(service = S::NAME, %state, "RPC service registered after start, gRPC-Web will not expose it");
        }
        self.inner.table.add(service, kind);
        if let Some(health) = &self.inner.health {
            health.track(S::NAME);
        }
        info!(service = S::NAME, kind = ?kind, "RPC service registered");
        self
    }

    /// 启动服务并阻塞到服务停止
    ///
    /// 已停止的服务直接返回 `Ok(())`；正在启动、运行或停止时返回
    /// [`Error::InvalidState`]。收到终止信号时执行 [`close`](Self::close)；
    /// 服务循环异常退出时先停止服务再返回错误。
    pub async fn start(&self) -> Result<()> {
        match self
            .inner
            .state
            .transition(&[LifecycleState::Idle], LifecycleState::Starting)
        {
            Ok(_) => {}
            Err(LifecycleState::Stopped) => return Ok(()),
            Err(state) => {
                return Err(Error::InvalidState {
                    operation: "start",
                    state,
                });
            }
        }

        let completion = CancellationToken::new();
        *self
            .inner
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(completion.clone());

        let options = &self.inner.options;
        info!(service_name = %options.name, "🚀 Starting service");
        // 启动期间到达的信号缓冲在订阅中，进入 Running 后立即处理
        let mut signals = options.signals.subscribe();

        if options.context.is_cancelled() {
            return Err(self.abort_start(&completion, Error::configuration("context cancelled before start")));
        }

        if let Err(e) = options.hooks.run_until_failure(HookStage::BeforeStart).await {
            return Err(self.abort_start(&completion, e));
        }

        // gRPC-Web 资源在所有服务注册完成后计算
        let mut router = self.inner.router.clone();
        if let Some(bridge) = &options.web_bridge {
            let rpc = RpcHandle::new(self.inner.dispatch.clone());
            router = mount_web(router, bridge.as_ref(), &rpc, &options.web_prefix);
            info!(prefix = %options.web_prefix, "gRPC-Web bridge mounted");
        }

        let mux = match self.bind().await {
            Ok(mux) => mux,
            Err(e) => return Err(self.abort_start(&completion, e)),
        };
        let stop = StopHandle::new();
        let tracker = TaskTracker::new();
        let mut mux = mux
            .with_abort(stop.abort_token())
            .with_tracker(tracker.clone());
        if let Some(matcher) = &options.matcher {
            mux = mux.with_matcher(matcher.clone());
        }
        let local_addr = mux.local_addr();

        let record = match self.inner.registration.register(&self.instance()).await {
            Ok(record) => record,
            Err(e) => {
                drop(mux);
                return Err(self.abort_start(&completion, e));
            }
        };

        let (report_tx, mut reports) = mpsc::channel(SERVE_REPORT_CAPACITY);
        if let Some(listener) = mux.rpc_listener() {
            let server = RpcServer::new(
                options.rpc.clone(),
                self.inner.dispatch.clone(),
                stop.shutdown_token(),
            );
            spawn_reporting(&tracker, report_tx.clone(), Component::Rpc, server.serve(listener));
        }
        if self.inner.serves_http {
            if let Some(listener) = mux.other_listener() {
                let router = assemble(router, self.inner.cors.clone(), &options.middleware);
                let server = HttpServer::new(router, stop.shutdown_token());
                spawn_reporting(&tracker, report_tx.clone(), Component::Http, server.serve(listener));
            }
        }
        let shutdown = stop.shutdown_token();
        spawn_reporting(&tracker, report_tx, Component::Mux, async move {
            mux.serve(shutdown)
                .await
                .map_err(|e| Error::serve(Component::Mux, e))
        });

        if let Some(health) = &self.inner.health {
            health.set_serving().await;
        }

        let run = RunHandles {
            stop,
            tracker,
            record: Some(record),
        };

        if let Err(e) = options.hooks.run_until_failure(HookStage::AfterStart).await {
            error!(service_name = %options.name, error = %e, "❌ After-start hook failed, stopping service");
            let _ = self
                .inner
                .state
                .transition(&[LifecycleState::Starting], LifecycleState::Stopping);
            let stopped = run_teardown(self.inner.clone(), run, completion).await;
            return Error::combine(std::iter::once(e).chain(stopped.err()));
        }

        *self.inner.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(run);
        if let Err(state) = self
            .inner
            .state
            .transition(&[LifecycleState::Starting], LifecycleState::Running)
        {
            warn!(%state, "Unexpected state after start");
        }
        self.spawn_context_watcher(completion.clone());
        info!(
            service_name = %options.name,
            address = %local_addr,
            tls = options.tls.is_some(),
            http = self.inner.serves_http,
            "✅ Service running"
        );

        let outcome = tokio::select! {
            Some(signal) = signals.recv() => {
                info!(%signal, "Shutdown signal received");
                self.close().await
            }
            Some(report) = reports.recv() => {
                let outcome = match report {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_shutdown_noise() => Ok(()),
                    Err(e) => Err(e),
                };
                let stopped = self.stop().await;
                Error::combine(outcome.err().into_iter().chain(stopped.err()))
            }
            _ = completion.cancelled() => Ok(()),
        };

        completion.cancelled().await;
        signals.unsubscribe();
        outcome
    }

    /// 绑定监听器并构建多路复用器；成功后实例地址更新为实际地址
    async fn bind(&self) -> Result<ProtocolMux> {
        let options = &self.inner.options;
        let prebound = self
            .inner
            .prebound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (address, listener) = match prebound {
            Some(listener) => {
                let address = options.address.clone();
                let listener = listener
                    .set_nonblocking(true)
                    .and_then(|()| TcpListener::from_std(listener))
                    .map_err(|source| Error::Bind {
                        address: address.clone(),
                        source,
                    })?;
                (address, listener)
            }
            None => {
                let address = normalize_address(&options.address)?;
                let listener = TcpListener::bind(&address)
                    .await
                    .map_err(|source| Error::Bind {
                        address: address.clone(),
                        source,
                    })?;
                (address, listener)
            }
        };
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            address: address.clone(),
            source,
        })?;

        self.inner
            .instance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_resolved_address(local_addr);
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        info!(requested = %address, address = %local_addr, "Listener bound");

        let tls = match &options.tls {
            Some(provider) => crate::tls::acceptor(provider.as_ref())?,
            None => None,
        };
        let mut mux = ProtocolMux::new(listener, options.mux.clone())
            .map_err(|source| Error::Bind { address, source })?;
        if let Some(acceptor) = tls {
            mux = mux.with_tls(acceptor);
        }
        Ok(mux)
    }

    /// 启动中止：状态回到 Idle，已获取的资源随调用方一起释放
    fn abort_start(&self, completion: &CancellationToken, error: Error) -> Error {
        let _ = self
            .inner
            .state
            .transition(&[LifecycleState::Starting], LifecycleState::Idle);
        completion.cancel();
        warn!(service_name = %self.inner.options.name, error = %error, "Service start aborted");
        error
    }

    fn spawn_context_watcher(&self, completion: CancellationToken) {
        let service = self.clone();
        let context = self.inner.options.context.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = context.cancelled() => {
                    info!("Context cancelled, stopping service");
                    if let Err(e) = service.stop().await {
                        warn!(error = %e, "Stop after context cancellation failed");
                    }
                }
                _ = completion.cancelled() => {}
            }
        });
    }

    /// 停止服务
    ///
    /// 幂等：服务未处于运行状态时直接返回 `Ok(())`（正在启动时先等待启动结束）。
    /// 返回的错误来自 before-stop / after-stop 钩子。
    pub async fn stop(&self) -> Result<()> {
        self.inner.state.settled().await;
        if self
            .inner
            .state
            .transition(&[LifecycleState::Running], LifecycleState::Stopping)
            .is_err()
        {
            debug!(state = %self.state(), "Stop ignored, service not running");
            return Ok(());
        }

        let run = self
            .inner
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let completion = self.completion_token().unwrap_or_default();
        match run {
            Some(run) => run_teardown(self.inner.clone(), run, completion).await,
            None => {
                let _ = self
                    .inner
                    .state
                    .transition(&[LifecycleState::Stopping], LifecycleState::Stopped);
                completion.cancel();
                Ok(())
            }
        }
    }

    /// 停止服务、等待拆除完成并关闭存储句柄
    ///
    /// 未启动的服务直接标记为 Stopped。存储句柄只关闭一次。
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self
            .inner
            .state
            .transition(&[LifecycleState::Idle], LifecycleState::Stopped)
            .is_ok()
        {
            info!(service_name = %self.inner.options.name, "Service closed before start");
        } else {
            if let Err(e) = self.stop().await {
                errors.push(e);
            }
            if let Some(completion) = self.completion_token() {
                completion.cancelled().await;
            }
        }

        if let Some(storage) = &self.inner.options.storage {
            if !self.inner.storage_closed.swap(true, Ordering::AcqRel) {
                match storage.close().await {
                    Ok(()) => info!("Storage closed"),
                    Err(e) => {
                        warn!(error = %e, "⚠️ Failed to close storage");
                        errors.push(Error::Storage(e));
                    }
                }
            }
        }

        Error::combine(errors)
    }

    fn completion_token(&self) -> Option<CancellationToken> {
        self.inner
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn id(&self) -> String {
        self.instance_field(|i| i.id.clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn version(&self) -> &str {
        &self.inner.options.version
    }

    /// 当前地址；绑定之后为实际监听地址
    pub fn address(&self) -> String {
        self.instance_field(|i| i.address.clone())
    }

    /// 实际监听地址，绑定前为 `None`
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance(&self) -> ServiceInstance {
        self.instance_field(Clone::clone)
    }

    fn instance_field<T>(&self, f: impl FnOnce(&ServiceInstance) -> T) -> T {
        f(&self
            .inner
            .instance
            .read()
            .unwrap_or_else(PoisonError::into_inner))
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }

    /// 订阅生命周期状态变化
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// 进程内调度通道，调用经过与网络路径相同的拦截器链
    pub fn in_process_channel(&self) -> InProcessChannel {
        self.inner.channel.clone()
    }

    pub fn storage(&self) -> Option<Arc<dyn Storage>> {
        self.inner.options.storage.clone()
    }

    pub fn health_reporter(&self) -> Option<HealthReporter> {
        self.inner.health.as_ref().map(HealthState::reporter)
    }

    /// 已注册的 RPC 服务名
    pub fn service_names(&self) -> Vec<String> {
        self.inner.table.service_names()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.options.name)
            .field("address", &self.address())
            .field("state", &self.state())
            .field("services", &self.service_names())
            .finish()
    }
}

impl Inner {
    /// 拆除顺序：before-stop 钩子 → 注销 → 健康状态 → 停止服务器 → after-stop 钩子 → 完成标记
    async fn teardown(self: Arc<Self>, run: RunHandles, completion: CancellationToken) -> Result<()> {
        info!(service_name = %self.options.name, "🛑 Stopping service");
        let mut errors = self.options.hooks.run_all(HookStage::BeforeStop).await;

        if let Some(record) = run.record {
            self.registration.deregister(record).await;
        }
        if let Some(health) = &self.health {
            health.set_not_serving().await;
        }

        let mut signals = self.options.signals.subscribe();
        run.stop.graceful_stop();
        run.tracker.close();
        tokio::select! {
            _ = run.tracker.wait() => {}
            Some(signal) = signals.recv() => {
                warn!(%signal, "Second signal received, forcing shutdown");
                run.stop.stop();
                run.tracker.wait().await;
            }
        }
        signals.unsubscribe();
        debug!("All serve loops joined");

        errors.extend(self.options.hooks.run_all(HookStage::AfterStop).await);

        let _ = self
            .state
            .transition(&[LifecycleState::Stopping], LifecycleState::Stopped);
        completion.cancel();
        info!(service_name = %self.options.name, "Service stopped");

        Error::combine(errors)
    }
}

/// 在独立任务中拆除，调用方的 future 被丢弃也不会中断
async fn run_teardown(inner: Arc<Inner>, run: RunHandles, completion: CancellationToken) -> Result<()> {
    match tokio::spawn(inner.teardown(run, completion)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Ok(()),
    }
}

/// 运行服务循环，并把终止结果写入报告通道
fn spawn_reporting<F>(
    tracker: &TaskTracker,
    reports: mpsc::Sender<Result<()>>,
    component: Component,
    serve: F,
) where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tracker.spawn(async move {
        let result = serve.await;
        match &result {
            Ok(()) => debug!(%component, "Serve loop finished"),
            Err(e) if e.is_shutdown_noise() => debug!(%component, "Serve loop closed"),
            Err(e) => error!(%component, error = %e, "❌ Serve loop failed"),
        }
        let _ = reports.send(result).await;
    });
}
