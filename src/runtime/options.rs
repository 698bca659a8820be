//! 服务选项
//!
//! 所有可配置项集中在 [`Options`] 中，通过 `with_*` 方法逐项设置，
//! 或由配置文件经 [`Options::from_config`] 生成。`Service::new` 会调用
//! [`Options::validate`] 做一次完整校验。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, CorsConfig};
use crate::error::{BoxError, Error, HookStage, Result};
use crate::interceptor::{Interceptor, SharedInterceptor};
use crate::mux::matcher::HTTP2_PREFACE;
use crate::mux::{MuxConfig, ProtocolMatcher};
use crate::registry::{NoopRegistry, ServiceRegistry};
use crate::server::{GatewayBridge, GrpcWebBridge, HttpMiddleware, RpcServerConfig, WebBridge, cors_layer};
use crate::storage::Storage;
use crate::tls::TlsProvider;
use crate::utils::normalize_address;

use super::hooks::{Hooks, hook};
use super::signal::{OsSignals, SignalSource};

/// 默认监听地址
pub const DEFAULT_ADDRESS: &str = ":8080";

/// 服务选项
pub struct Options {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) address: String,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) listener: Option<std::net::TcpListener>,

    pub(crate) tls: Option<Arc<dyn TlsProvider>>,
    pub(crate) registry: Arc<dyn ServiceRegistry>,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) signals: Arc<dyn SignalSource>,
    pub(crate) context: CancellationToken,
    pub(crate) hooks: Hooks,

    pub(crate) unary_interceptors: Vec<SharedInterceptor>,
    pub(crate) stream_interceptors: Vec<SharedInterceptor>,
    pub(crate) rpc: RpcServerConfig,
    pub(crate) health: bool,
    pub(crate) reflection: bool,
    pub(crate) descriptor_sets: Vec<&'static [u8]>,

    pub(crate) mux: MuxConfig,
    pub(crate) matcher: Option<Arc<dyn ProtocolMatcher>>,

    pub(crate) gateway: Option<Arc<dyn GatewayBridge>>,
    pub(crate) web_bridge: Option<Arc<dyn WebBridge>>,
    pub(crate) web_prefix: String,
    pub(crate) http_router: Option<Router>,
    pub(crate) middleware: Vec<HttpMiddleware>,
    pub(crate) cors: Option<CorsConfig>,
}

impl Options {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            address: DEFAULT_ADDRESS.to_string(),
            metadata: HashMap::new(),
            listener: None,
            tls: None,
            registry: Arc::new(NoopRegistry),
            storage: None,
            signals: Arc::new(OsSignals),
            context: CancellationToken::new(),
            hooks: Hooks::new(),
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
            rpc: RpcServerConfig::default(),
            health: true,
            reflection: false,
            descriptor_sets: Vec::new(),
            mux: MuxConfig::default(),
            matcher: None,
            gateway: None,
            web_bridge: None,
            web_prefix: String::new(),
            http_router: None,
            middleware: Vec::new(),
            cors: Some(CorsConfig::default()),
        }
    }

    /// 由配置文件生成选项
    pub fn from_config(config: &Config) -> Self {
        let mut options = Self::new(config.service.name.clone())
            .with_version(config.service.version.clone())
            .with_address(config.service.address.clone())
            .with_metadata(config.service.metadata.clone())
            .with_rpc_config(RpcServerConfig::from(&config.rpc))
            .with_health(config.rpc.health)
            .with_reflection(config.rpc.reflection)
            .with_mux_config(MuxConfig::from(&config.mux))
            .with_web_prefix(config.http.web_prefix.clone());
        if config.http.web_bridge {
            options = options.with_web_bridge();
        }
        options.cors = config.cors.enabled.then(|| config.cors.clone());
        options
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 监听地址 `host:port`，host 为空表示所有网卡，端口 0 表示随机端口
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// 使用调用方预先绑定的监听器（例如由进程管理器传入），地址取自监听器
    pub fn with_listener(mut self, listener: std::net::TcpListener) -> Self {
        if let Ok(addr) = listener.local_addr() {
            self.address = addr.to_string();
        }
        self.listener = Some(listener);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tls(mut self, provider: impl TlsProvider) -> Self {
        self.tls = Some(Arc::new(provider));
        self
    }

    pub fn with_registry<R: ServiceRegistry>(mut self, registry: Arc<R>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_storage<S: Storage>(mut self, storage: Arc<S>) -> Self {
        self.storage = Some(storage as Arc<dyn Storage>);
        self
    }

    /// 替换终止信号源（默认监听 SIGINT/SIGQUIT）
    pub fn with_signals(mut self, signals: impl SignalSource) -> Self {
        self.signals = Arc::new(signals);
        self
    }

    /// 父级取消上下文，取消后服务自动停止
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.context = context;
        self
    }

    pub fn before_start<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.with_hook(HookStage::BeforeStart, f)
    }

    pub fn after_start<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.with_hook(HookStage::AfterStart, f)
    }

    pub fn before_stop<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.with_hook(HookStage::BeforeStop, f)
    }

    pub fn after_stop<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.with_hook(HookStage::AfterStop, f)
    }

    fn with_hook<F, Fut>(mut self, stage: HookStage, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.hooks.push(stage, hook(f));
        self
    }

    /// 同时追加到一元与流式拦截器链
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        let interceptor: SharedInterceptor = Arc::new(interceptor);
        self.unary_interceptors.push(interceptor.clone());
        self.stream_interceptors.push(interceptor);
        self
    }

    pub fn with_unary_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.unary_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_stream_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.stream_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_rpc_config(mut self, config: RpcServerConfig) -> Self {
        self.rpc = config;
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.rpc.max_concurrent_streams = Some(max);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.rpc.timeout = Some(timeout);
        self
    }

    /// gRPC 健康检查服务（默认开启）
    pub fn with_health(mut self, enabled: bool) -> Self {
        self.health = enabled;
        self
    }

    /// gRPC 反射服务
    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    /// 注册编码后的 `FileDescriptorSet` 并开启反射
    pub fn with_file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.reflection = true;
        self.descriptor_sets.push(encoded);
        self
    }

    pub fn with_mux_config(mut self, config: MuxConfig) -> Self {
        self.mux = config;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.mux.read_timeout = timeout;
        self
    }

    pub fn with_matcher(mut self, matcher: impl ProtocolMatcher) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    /// HTTP → RPC 网关，在 `Service::new` 时注册
    pub fn with_gateway(mut self, gateway: impl GatewayBridge) -> Self {
        self.gateway = Some(Arc::new(gateway));
        self
    }

    /// 启用默认的 gRPC-Web 桥接
    pub fn with_web_bridge(self) -> Self {
        self.with_custom_web_bridge(GrpcWebBridge)
    }

    pub fn with_custom_web_bridge(mut self, bridge: impl WebBridge) -> Self {
        self.web_bridge = Some(Arc::new(bridge));
        self
    }

    /// gRPC-Web 挂载前缀，转发前会被剥离
    pub fn with_web_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.web_prefix = prefix.into();
        self
    }

    /// 调用方自己的 HTTP 路由，与网关、gRPC-Web 共用同一个 HTTP 服务器
    pub fn with_http_router(mut self, router: Router) -> Self {
        self.http_router = Some(match self.http_router.take() {
            Some(existing) => existing.merge(router),
            None => router,
        });
        self
    }

    /// HTTP 中间件，先注册的在最外层
    pub fn with_http_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.cors = Some(cors);
        self
    }

    pub fn without_cors(mut self) -> Self {
        self.cors = None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 是否需要启动 HTTP 服务器
    pub(crate) fn serves_http(&self) -> bool {
        self.gateway.is_some() || self.web_bridge.is_some() || self.http_router.is_some()
    }

    /// 一次性校验全部选项
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("service name is required"));
        }
        normalize_address(&self.address)?;

        if self.mux.read_timeout.is_zero() {
            return Err(Error::configuration("mux read timeout must be positive"));
        }
        if self.mux.max_sniff_bytes < HTTP2_PREFACE.len() {
            return Err(Error::configuration(format!(
                "mux sniff limit must be at least {} bytes",
                HTTP2_PREFACE.len()
            )));
        }
        if !self.web_prefix.is_empty() && !self.web_prefix.starts_with('/') {
            return Err(Error::configuration(format!(
                "web prefix {:?} must start with '/'",
                self.web_prefix
            )));
        }
        if self.web_prefix == "/" {
            return Err(Error::configuration("web prefix must not be '/'; leave it empty to mount at the root"));
        }
        if let Some(cors) = &self.cors {
            cors_layer(cors)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("metadata", &self.metadata)
            .field("listener", &self.listener.is_some())
            .field("tls", &self.tls.is_some())
            .field("hooks", &self.hooks)
            .field("unary_interceptors", &self.unary_interceptors.len())
            .field("stream_interceptors", &self.stream_interceptors.len())
            .field("rpc", &self.rpc)
            .field("health", &self.health)
            .field("reflection", &self.reflection)
            .field("mux", &self.mux)
            .field("gateway", &self.gateway.is_some())
            .field("web_bridge", &self.web_bridge.is_some())
            .field("web_prefix", &self.web_prefix)
            .field("cors", &self.cors)
            .finish_non_exhaustive()
    }
}
