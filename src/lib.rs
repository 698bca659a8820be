//! Flare Service Runtime
//!
//! Serves gRPC and HTTP on a single listener through a protocol multiplexer,
//! shares one interceptor chain between the network server and an in-process
//! channel, and drives a start/stop lifecycle with hooks, service registration
//! and signal-driven graceful shutdown.

pub mod config;
pub mod error;
pub mod health;
pub mod interceptor;
pub mod logging;
pub mod mux;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod tls;
pub mod types;
pub mod utils;

// Re-exports
pub use config::Config;
pub use error::{BoxError, Component, Error, HookStage, Result};
pub use health::HealthState;
pub use interceptor::{
    CallKind, Interceptor, InterceptorChain, Next, RpcRequest, RpcResponse, SharedInterceptor,
};
pub use logging::LogFormat;
pub use mux::{MuxConfig, MuxError, ProtocolMux};
pub use registry::{MemoryRegistry, NoopRegistry, RegistrationRecord, ServiceRegistry};
pub use runtime::{LifecycleState, ManualSignals, Options, Service, Signal, SignalSource};
pub use server::{GatewayBridge, GrpcWebBridge, InProcessChannel, WebBridge};
pub use storage::Storage;
pub use tls::TlsProvider;
pub use types::ServiceInstance;
