use async_trait::async_trait;
use http::{HeaderName, HeaderValue};

use super::{Interceptor, Next, RpcRequest, RpcResponse};
use crate::error::{Error, Result};

/// 服务名元数据键
pub const SERVICE_NAME_KEY: &str = "grpc-service-name";
/// 服务版本元数据键
pub const SERVICE_VERSION_KEY: &str = "grpc-service-version";

/// 元数据拦截器
///
/// 在请求和响应上写入固定的元数据，例如服务名和版本。
#[derive(Debug, Clone)]
pub struct MetadataInterceptor {
    key: HeaderName,
    value: HeaderValue,
}

impl MetadataInterceptor {
    pub fn new(key: &str, value: &str) -> Result<Self> {
        let key = HeaderName::try_from(key)
            .map_err(|e| Error::configuration(format!("invalid metadata key {key:?}: {e}")))?;
        let value = HeaderValue::try_from(value)
            .map_err(|e| Error::configuration(format!("invalid metadata value {value:?}: {e}")))?;
        Ok(Self { key, value })
    }

    pub fn service_name(name: &str) -> Result<Self> {
        Self::new(SERVICE_NAME_KEY, name)
    }

    pub fn service_version(version: &str) -> Result<Self> {
        Self::new(SERVICE_VERSION_KEY, version)
    }

    pub fn key(&self) -> &HeaderName {
        &self.key
    }
}

#[async_trait]
impl Interceptor for MetadataInterceptor {
    async fn intercept(&self, mut request: RpcRequest, next: Next) -> RpcResponse {
        request
            .headers_mut()
            .insert(self.key.clone(), self.value.clone());
        let mut response = next.run(request).await;
        response
            .headers_mut()
            .insert(self.key.clone(), self.value.clone());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_values() {
        assert!(MetadataInterceptor::service_name("greeter").is_ok());
        assert!(MetadataInterceptor::service_name("bad\nvalue").is_err());
        assert!(MetadataInterceptor::new("bad key", "v").is_err());
    }
}
