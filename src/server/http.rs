//! HTTP 服务器

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use http::{HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, info};

use crate::config::CorsConfig;
use crate::error::{Component, Error, Result};
use crate::mux::MuxListener;

/// 通用 HTTP 中间件，包在 CORS 与路由外层
pub type HttpMiddleware = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// 根据配置构建 CORS 层
///
/// 空的来源/请求头列表（或 `*`）表示回显请求值，这样才能与
/// `allow_credentials` 同时使用。
pub fn cors_layer(config: &CorsConfig) -> Result<CorsLayer> {
    let origins = if config.allow_origins.is_empty() || config.allow_origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        let values = config
            .allow_origins
            .iter()
            .map(|o| {
                HeaderValue::from_str(o)
                    .map_err(|e| Error::configuration(format!("invalid cors origin {o:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(values)
    };

    let methods = if config.allow_methods.iter().any(|m| m == "*") {
        AllowMethods::mirror_request()
    } else {
        let values = config
            .allow_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|e| Error::configuration(format!("invalid cors method {m:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowMethods::list(values)
    };

    let headers = if config.allow_headers.is_empty() || config.allow_headers.iter().any(|h| h == "*") {
        AllowHeaders::mirror_request()
    } else {
        let values = config
            .allow_headers
            .iter()
            .map(|h| {
                HeaderName::from_bytes(h.as_bytes())
                    .map_err(|e| Error::configuration(format!("invalid cors header {h:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        AllowHeaders::list(values)
    };

    let mut layer = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(config.allow_credentials);
    if let Some(secs) = config.max_age_secs {
        layer = layer.max_age(Duration::from_secs(secs));
    }
    Ok(layer)
}

/// 组装最终的处理器：中间件 → CORS → 路由
///
/// 中间件按注册顺序由外到内。
pub(crate) fn assemble(router: Router, cors: Option<CorsLayer>, middleware: &[HttpMiddleware]) -> Router {
    let mut router = router;
    if let Some(cors) = cors {
        router = router.layer(cors);
    }
    for apply in middleware.iter().rev() {
        router = apply(router);
    }
    router
}

/// 服务于复用器 "other" 子监听器的 axum 服务器
pub struct HttpServer {
    router: Router,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(router: Router, shutdown: CancellationToken) -> Self {
        Self { router, shutdown }
    }

    /// 运行直到关闭令牌触发并且所有连接排空
    pub async fn serve(self, listener: MuxListener) -> Result<()> {
        info!(address = %listener.local_addr(), "🌐 HTTP server listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(self.shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::serve(Component::Http, e))?;
        debug!("HTTP server drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[test]
    fn default_cors_config_is_valid() {
        assert!(cors_layer(&CorsConfig::default()).is_ok());
    }

    #[test]
    fn rejects_invalid_method() {
        let config = CorsConfig {
            allow_methods: vec!["NOT A METHOD".to_string()],
            ..CorsConfig::default()
        };
        assert!(matches!(cors_layer(&config), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn default_cors_mirrors_origin_with_credentials() {
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let app = assemble(router, Some(cors_layer(&CorsConfig::default()).unwrap()), &[]);

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/ping")
                    .header("origin", "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            response.headers().get("access-control-allow-credentials").unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| -> HttpMiddleware {
            Arc::new(move |router: Router| {
                let order = order.clone();
                router.layer(axum::middleware::from_fn(
                    move |request: axum::extract::Request, next: axum::middleware::Next| {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(name);
                            next.run(request).await
                        }
                    },
                ))
            })
        };

        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let app = assemble(router, None, &[tag("outer", order.clone()), tag("inner", order.clone())]);
        app.oneshot(http::Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }
}
