//! 错误处理模块
//!
//! 提供运行时统一的错误类型、错误聚合以及"关闭噪声"判定。

mod noise;

pub use noise::is_shutdown_noise;

use std::fmt;
use thiserror::Error;

use crate::runtime::state::LifecycleState;

/// 外部协作者（钩子、注册中心、存储、桥接器）返回的错误类型
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

/// 生命周期钩子阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::BeforeStart => "before-start",
            HookStage::AfterStart => "after-start",
            HookStage::BeforeStop => "before-stop",
            HookStage::AfterStop => "after-stop",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 后台服务循环
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Rpc,
    Http,
    Mux,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Component::Rpc => "rpc server",
            Component::Http => "http server",
            Component::Mux => "protocol mux",
        })
    }
}

/// 运行时统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误，在构造阶段返回，此时尚未获取任何资源
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// 监听地址绑定失败
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS 提供者失败
    #[error("tls provider failed: {0}")]
    Tls(#[source] BoxError),

    /// 生命周期钩子失败
    #[error("{stage} hook failed: {source}")]
    Hook {
        stage: HookStage,
        #[source]
        source: BoxError,
    },

    /// 服务注册失败（启动阶段致命）
    #[error("service registration failed: {0}")]
    Registration(#[source] BoxError),

    /// 服务循环异常退出
    #[error("{component} failed: {source}")]
    Serve {
        component: Component,
        #[source]
        source: BoxError,
    },

    /// 存储句柄关闭失败
    #[error("storage close failed: {0}")]
    Storage(#[source] BoxError),

    /// 当前生命周期状态不允许该操作
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    /// 多个错误的聚合
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn hook(stage: HookStage, source: BoxError) -> Self {
        Error::Hook { stage, source }
    }

    pub fn serve(component: Component, source: impl Into<BoxError>) -> Self {
        Error::Serve {
            component,
            source: source.into(),
        }
    }

    /// 是否为关闭过程中的预期噪声（例如监听器已关闭）
    pub fn is_shutdown_noise(&self) -> bool {
        match self {
            Error::Serve { source, .. } => is_shutdown_noise(source.as_ref()),
            Error::Multiple(errors) => errors.iter().all(Error::is_shutdown_noise),
            _ => false,
        }
    }

    /// 聚合错误列表：空列表为成功，单个错误原样返回，嵌套聚合会被展开
    pub fn combine(errors: impl IntoIterator<Item = Error>) -> Result<()> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(Error::Multiple(flat)),
        }
    }

    /// 聚合中的错误（非聚合错误返回自身）
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Multiple(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(msg: &str) -> Error {
        Error::Storage(msg.into())
    }

    #[test]
    fn combine_empty_is_ok() {
        assert!(Error::combine(Vec::new()).is_ok());
    }

    #[test]
    fn combine_single_is_unwrapped() {
        let err = Error::combine(vec![storage("disk gone")]).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn combine_keeps_every_error_and_flattens() {
        let nested = Error::Multiple(vec![storage("a"), storage("b")]);
        let err = Error::combine(vec![nested, Error::configuration("c")]).unwrap_err();
        assert_eq!(err.errors().len(), 3);
        let text = err.to_string();
        assert!(text.contains("a") && text.contains("b") && text.contains("c"));
    }

    #[test]
    fn serve_error_from_closed_listener_is_noise() {
        let err = Error::serve(
            Component::Mux,
            std::io::Error::other("use of closed network connection"),
        );
        assert!(err.is_shutdown_noise());

        let err = Error::serve(Component::Rpc, std::io::Error::other("h2 protocol error"));
        assert!(!err.is_shutdown_noise());
    }
}
