use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RegistrationRecord, ServiceRegistry};
use crate::error::BoxError;
use crate::types::ServiceInstance;

/// 内存注册中心
///
/// 适用于本地运行和测试：记录当前注册的实例，并统计注册、注销次数。
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    instances: RwLock<HashMap<String, ServiceInstance>>,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前注册的实例
    pub async fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn is_registered(&self, instance_id: &str) -> bool {
        self.instances.read().await.contains_key(instance_id)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistration_count(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<RegistrationRecord, BoxError> {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(RegistrationRecord::new(instance, instance.id.clone()))
    }

    async fn deregister(&self, record: RegistrationRecord) -> Result<(), BoxError> {
        self.deregistrations.fetch_add(1, Ordering::SeqCst);
        match self.instances.write().await.remove(record.key()) {
            Some(_) => Ok(()),
            None => Err(format!("instance {} is not registered", record.key()).into()),
        }
    }
}
