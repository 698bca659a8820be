use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use uuid::Uuid;

/// 服务实例身份
///
/// 构造时生成唯一 ID；地址在绑定监听器之后更新为实际解析出的地址
/// （支持端口 0）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, version: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            version: version.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// 绑定完成后记录实际地址
    pub(crate) fn set_resolved_address(&mut self, addr: SocketAddr) {
        self.address = addr.to_string();
    }
}
