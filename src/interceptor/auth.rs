use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;
use tracing::{debug, warn};

use super::{Interceptor, Next, RpcRequest, RpcResponse, status_response};

/// 令牌校验器
///
/// 校验通过时可以向请求扩展写入身份信息，下游服务通过
/// `tonic::Request::extensions` 读取。
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate(&self, token: &str, extensions: &mut http::Extensions) -> Result<(), Status>;
}

/// 校验通过的 Bearer 令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

/// 固定令牌集合校验器
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str, extensions: &mut http::Extensions) -> Result<(), Status> {
        if self.tokens.contains(token) {
            extensions.insert(BearerToken(token.to_string()));
            Ok(())
        } else {
            Err(Status::unauthenticated("Invalid token"))
        }
    }
}

/// Bearer 令牌认证拦截器
#[derive(Clone)]
pub struct TokenAuthInterceptor {
    validator: Arc<dyn TokenValidator>,
}

impl TokenAuthInterceptor {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }
}

/// 从 `authorization` 头中取出 `Bearer` 令牌
fn bearer_token(headers: &http::HeaderMap) -> Result<String, Status> {
    let value = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Status::unauthenticated("Request unauthenticated with bearer"))?;

    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| Status::unauthenticated("Bad authorization string"))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(Status::unauthenticated("Request unauthenticated with bearer"));
    }
    Ok(token.trim().to_string())
}

#[async_trait]
impl Interceptor for TokenAuthInterceptor {
    async fn intercept(&self, mut request: RpcRequest, next: Next) -> RpcResponse {
        let method = request.uri().path().to_string();
        let token = match bearer_token(request.headers()) {
            Ok(token) => token,
            Err(status) => {
                debug!(%method, "Missing bearer token");
                return status_response(status);
            }
        };

        if let Err(status) = self.validator.validate(&token, request.extensions_mut()).await {
            warn!(%method, code = ?status.code(), "Token validation failed");
            return status_response(status);
        }

        next.run(request).await
    }
}
