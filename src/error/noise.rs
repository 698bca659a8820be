use std::error::Error as StdError;

use crate::mux::MuxError;

/// 关闭过程中常见的错误消息，出现在外部错误链中时同样视为预期噪声
const SHUTDOWN_MESSAGES: &[&str] = &[
    "use of closed network connection",
    "listener closed",
    "mux: server closed",
];

/// 判断错误（及其 source 链）是否属于正常关闭产生的噪声
///
/// 服务循环与拆除顺序之间存在竞争：监听器先被关闭时，服务循环会以
/// "监听器已关闭"一类的错误返回，这不应被报告为故障。
pub fn is_shutdown_noise(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(MuxError::Closed) = err.downcast_ref::<MuxError>() {
            return true;
        }
        let message = err.to_string();
        if SHUTDOWN_MESSAGES.iter().any(|m| message.contains(m)) {
            return true;
        }
        current = err.source();
    }
    false
}
