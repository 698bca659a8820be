//! 生命周期状态机
//!
//! `Idle → Starting → Running → Stopping → Stopped`，外加启动失败回滚
//! (`Starting → Idle`)、启动后失败 (`Starting → Stopping`) 以及未启动直接关闭
//! (`Idle → Stopped`)。所有迁移都经由 [`StateCell`] 串行化。

use std::fmt;
use tokio::sync::watch;

/// 服务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    /// 判断迁移是否合法
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Stopped)
                | (Starting, Running)
                | (Starting, Idle)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// 终态，不可再迁移
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Stopped
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 可观察的状态单元
///
/// 基于 `watch` 通道：读取是无锁快照，迁移是一次 compare-and-set，
/// 等待方可以订阅状态变化。
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<LifecycleState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Idle);
        Self { tx }
    }

    /// 当前状态快照
    pub fn get(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// 当前状态属于 `from` 之一且迁移合法时迁移到 `to`
    ///
    /// 成功返回迁移前的状态，失败返回观察到的当前状态。
    pub fn transition(
        &self,
        from: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<LifecycleState, LifecycleState> {
        let mut outcome = Err(LifecycleState::Idle);
        self.tx.send_if_modified(|state| {
            let current = *state;
            if from.contains(&current) && current.can_transition_to(to) {
                *state = to;
                outcome = Ok(current);
                true
            } else {
                outcome = Err(current);
                false
            }
        });
        outcome
    }

    /// 等待状态离开 `Starting`，返回稳定后的状态
    pub async fn settled(&self) -> LifecycleState {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|s| *s != LifecycleState::Starting).await {
            Ok(state) => *state,
            Err(_) => self.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn allowed_transitions() {
        assert!(Idle.can_transition_to(Starting));
        assert!(Idle.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Idle));
        assert!(Starting.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn rejected_transitions() {
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn transition_is_compare_and_set() {
        let cell = StateCell::new();
        assert_eq!(cell.transition(&[Idle], Starting), Ok(Idle));
        assert_eq!(cell.transition(&[Idle], Starting), Err(Starting));
        assert_eq!(cell.transition(&[Starting], Running), Ok(Starting));
        assert_eq!(cell.get(), Running);
        // 非法迁移即使在 from 列表中也会被拒绝
        assert_eq!(cell.transition(&[Running], Idle), Err(Running));
    }

    #[tokio::test]
    async fn settled_waits_out_starting() {
        let cell = std::sync::Arc::new(StateCell::new());
        cell.transition(&[Idle], Starting).unwrap();

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.settled().await })
        };
        tokio::task::yield_now().await;
        cell.transition(&[Starting], Running).unwrap();

        assert_eq!(waiter.await.unwrap(), Running);
    }
}
