//! 生命周期钩子
//!
//! 四个阶段各自维护一个有序列表。启动阶段（before-start、after-start）遇到
//! 第一个错误即中止；停止阶段（before-stop、after-stop）全部执行并汇总错误。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{BoxError, Error, HookStage, Result};

/// 钩子返回的 Future
pub type HookFuture = BoxFuture<'static, std::result::Result<(), BoxError>>;

/// 生命周期钩子
pub type Hook = Arc<dyn Fn() -> HookFuture + Send + Sync>;

/// 由异步闭包构造钩子
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move || -> HookFuture { Box::pin(f()) })
}

/// 按阶段分组的钩子列表
#[derive(Clone, Default)]
pub struct Hooks {
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加钩子，按注册顺序执行
    pub fn push(&mut self, stage: HookStage, hook: Hook) {
        self.stage_mut(stage).push(hook);
    }

    /// 指定阶段的钩子数量
    pub fn len(&self, stage: HookStage) -> usize {
        self.stage(stage).len()
    }

    pub fn is_empty(&self) -> bool {
        self.before_start.is_empty()
            && self.after_start.is_empty()
            && self.before_stop.is_empty()
            && self.after_stop.is_empty()
    }

    fn stage(&self, stage: HookStage) -> &[Hook] {
        match stage {
            HookStage::BeforeStart => &self.before_start,
            HookStage::AfterStart => &self.after_start,
            HookStage::BeforeStop => &self.before_stop,
            HookStage::AfterStop => &self.after_stop,
        }
    }

    fn stage_mut(&mut self, stage: HookStage) -> &mut Vec<Hook> {
        match stage {
            HookStage::BeforeStart => &mut self.before_start,
            HookStage::AfterStart => &mut self.after_start,
            HookStage::BeforeStop => &mut self.before_stop,
            HookStage::AfterStop => &mut self.after_stop,
        }
    }

    /// 顺序执行，遇到第一个错误立即返回
    pub(crate) async fn run_until_failure(&self, stage: HookStage) -> Result<()> {
        for (index, hook) in self.stage(stage).iter().enumerate() {
            debug!(%stage, index, "Running lifecycle hook");
            hook().await.map_err(|e| Error::hook(stage, e))?;
        }
        Ok(())
    }

    /// 全部执行，返回所有失败
    pub(crate) async fn run_all(&self, stage: HookStage) -> Vec<Error> {
        let mut errors = Vec::new();
        for (index, hook) in self.stage(stage).iter().enumerate() {
            debug!(%stage, index, "Running lifecycle hook");
            if let Err(e) = hook().await {
                warn!(%stage, index, error = %e, "Lifecycle hook failed");
                errors.push(Error::hook(stage, e));
            }
        }
        errors
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_start", &self.before_start.len())
            .field("after_start", &self.after_start.len())
            .field("before_stop", &self.before_stop.len())
            .field("after_stop", &self.after_stop.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, fail: bool) -> Hook {
        let log = log.clone();
        hook(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                if fail { Err(format!("{name} failed").into()) } else { Ok(()) }
            }
        })
    }

    #[tokio::test]
    async fn start_stage_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        hooks.push(HookStage::BeforeStart, recording(&log, "a", false));
        hooks.push(HookStage::BeforeStart, recording(&log, "b", true));
        hooks.push(HookStage::BeforeStart, recording(&log, "c", false));

        let err = hooks.run_until_failure(HookStage::BeforeStart).await.unwrap_err();
        assert!(matches!(err, Error::Hook { stage: HookStage::BeforeStart, .. }));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stop_stage_runs_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        hooks.push(HookStage::AfterStop, recording(&log, "a", true));
        hooks.push(HookStage::AfterStop, recording(&log, "b", false));
        hooks.push(HookStage::AfterStop, recording(&log, "c", true));

        let errors = hooks.run_all(HookStage::AfterStop).await;
        assert_eq!(errors.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
