//! gRPC 健康检查
//!
//! 包装 `tonic-health` 的 reporter，并记住已注册的服务名，
//! 启动后统一标记为 SERVING，停止时标记为 NOT_SERVING。

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tonic_health::ServingStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::server::HealthReporter;
use tracing::debug;

/// 整体状态使用的空服务名
pub const OVERALL: &str = "";

#[derive(Clone)]
pub struct HealthState {
    reporter: HealthReporter,
    services: Arc<Mutex<Vec<String>>>,
}

impl HealthState {
    /// 创建状态与需要注册到服务表的健康检查服务
    pub fn new() -> (Self, HealthServer<impl Health>) {
        let (reporter, server) = tonic_health::server::health_reporter();
        let state = Self {
            reporter,
            services: Arc::new(Mutex::new(Vec::new())),
        };
        (state, server)
    }

    pub fn reporter(&self) -> HealthReporter {
        self.reporter.clone()
    }

    /// 记录需要跟随生命周期切换状态的服务
    pub fn track(&self, service: impl Into<String>) {
        let service = service.into();
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if !services.contains(&service) {
            services.push(service);
        }
    }

    pub fn tracked(&self) -> Vec<String> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn set_serving(&self) {
        self.set_all(ServingStatus::Serving).await;
    }

    pub async fn set_not_serving(&self) {
        self.set_all(ServingStatus::NotServing).await;
    }

    async fn set_all(&self, status: ServingStatus) {
        self.reporter.set_service_status(OVERALL, status).await;
        for service in self.tracked() {
            self.reporter.set_service_status(&service, status).await;
        }
        debug!(status = ?status, "Health status updated");
    }
}

impl fmt::Debug for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthState")
            .field("services", &self.tracked())
            .finish()
    }
}
