//! 服务注册
//!
//! 启动时向注册中心注册实例，停止时注销。注册失败会中止启动；注销是
//! 尽力而为的，失败只记录日志。未配置注册中心时使用 [`NoopRegistry`]。

mod memory;

pub use memory::MemoryRegistry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{BoxError, Error, Result};
use crate::types::ServiceInstance;

/// 注册中心能力接口
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// 注册实例，返回用于注销的记录
    async fn register(&self, instance: &ServiceInstance) -> std::result::Result<RegistrationRecord, BoxError>;

    /// 注销实例，记录在此之后被丢弃
    async fn deregister(&self, record: RegistrationRecord) -> std::result::Result<(), BoxError>;
}

/// 注册记录
///
/// 由注册中心返回的不透明句柄，只能用于一次注销。
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationRecord {
    key: String,
    instance_id: String,
    service_name: String,
    address: String,
    registered_at: DateTime<Utc>,
}

impl RegistrationRecord {
    /// 由注册中心构造记录，`key` 为注册中心内部的标识
    pub fn new(instance: &ServiceInstance, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            instance_id: instance.id.clone(),
            service_name: instance.name.clone(),
            address: instance.address.clone(),
            registered_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }
}

/// 空注册中心
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistry;

#[async_trait]
impl ServiceRegistry for NoopRegistry {
    async fn register(&self, instance: &ServiceInstance) -> std::result::Result<RegistrationRecord, BoxError> {
        Ok(RegistrationRecord::new(instance, instance.id.clone()))
    }

    async fn deregister(&self, _record: RegistrationRecord) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// 运行时与注册中心之间的网关
#[derive(Clone)]
pub struct RegistrationGateway {
    registry: Arc<dyn ServiceRegistry>,
}

impl RegistrationGateway {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// 注册实例，失败时返回 `Error::Registration`
    pub async fn register(&self, instance: &ServiceInstance) -> Result<RegistrationRecord> {
        let record = self
            .registry
            .register(instance)
            .await
            .map_err(Error::Registration)?;
        info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            address = %instance.address,
            "✅ Service registered"
        );
        Ok(record)
    }

    /// 尽力注销，失败只记录日志
    pub async fn deregister(&self, record: RegistrationRecord) {
        let service_name = record.service_name().to_string();
        let instance_id = record.instance_id().to_string();
        match self.registry.deregister(record).await {
            Ok(()) => info!(%service_name, %instance_id, "Service deregistered"),
            Err(e) => warn!(%service_name, %instance_id, error = %e, "⚠️ Failed to deregister service"),
        }
    }
}

impl Default for RegistrationGateway {
    fn default() -> Self {
        Self::new(Arc::new(NoopRegistry))
    }
}

impl fmt::Debug for RegistrationGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationGateway").finish_non_exhaustive()
    }
}
