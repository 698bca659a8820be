//! gRPC、gRPC-Web 与普通 HTTP 共用一个端口
//!
//! ```bash
//! cargo run --example unified -- config.toml
//! grpcurl -plaintext 127.0.0.1:8080 grpc.health.v1.Health/Check
//! curl http://127.0.0.1:8080/hello
//! ```

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use flare_service::interceptor::{LoggingInterceptor, TracingInterceptor};
use flare_service::registry::MemoryRegistry;
use flare_service::{Config, Options, Service, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(path)?,
        None => {
            let mut config = Config::default();
            config.service.name = "unified-demo".to_string();
            config.service.version = env!("CARGO_PKG_VERSION").to_string();
            config.http.web_bridge = true;
            config
        }
    };
    logging::init_with_filter(config.logging.format, &config.logging.level)?;

    let registry = Arc::new(MemoryRegistry::new());
    let options = Options::from_config(&config)
        .with_registry(registry.clone())
        .with_interceptor(TracingInterceptor::new())
        .with_interceptor(LoggingInterceptor::new())
        .with_http_router(Router::new().route("/hello", get(|| async { "hello from the shared port" })))
        .after_start(|| async {
            info!("Demo is up, press Ctrl+C to stop (twice to force)");
            Ok(())
        });

    let service = Service::new(options)?;
    service.start().await?;

    info!(deregistrations = registry.deregistration_count(), "Demo finished");
    Ok(())
}
