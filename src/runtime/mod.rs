//! 服务运行时
//!
//! 生命周期状态机、钩子、终止信号与服务选项。
//!
//! ```rust,no_run
//! use flare_service::{Options, Service};
//!
//! # async fn run() -> flare_service::Result<()> {
//! let service = Service::new(
//!     Options::new("greeter")
//!         .with_version("1.0.0")
//!         .with_address(":8080")
//!         .with_web_bridge(),
//! )?;
//! // service.register_service(GreeterServer::new(handler));
//! service.start().await
//! # }
//! ```

pub mod hooks;
pub mod options;
pub mod service;
pub mod signal;
pub mod state;

pub use hooks::{Hook, HookFuture, Hooks, hook};
pub use options::Options;
pub use service::Service;
pub use signal::{ManualSignals, OsSignals, Signal, SignalSource, Subscription};
pub use state::{LifecycleState, StateCell};
