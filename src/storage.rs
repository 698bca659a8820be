//! 存储句柄
//!
//! 运行时不关心存储的具体实现，只负责在 `close` 时将其关闭一次。

use async_trait::async_trait;

use crate::error::BoxError;

/// 由服务实例持有的存储句柄（数据库连接池等）
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// 释放底层资源
    async fn close(&self) -> Result<(), BoxError>;
}
