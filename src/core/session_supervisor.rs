//! 会话监管：停止与暂停
//!
//! 持有 CancellationToken（stop 或进程退出时取消）与暂停标志；处理循环通过它等待恢复、感知中断。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 中断原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Paused,
    Stopped,
    /// 进程退出：会话状态不变，留给下次启动恢复
    Shutdown,
}

/// 单个处理循环的生命周期控制：取消令牌与暂停状态
#[derive(Debug)]
pub struct SessionSupervisor {
    /// stop 时触发
    cancel_token: CancellationToken,
    /// 取消是否来自进程退出
    shutting_down: AtomicBool,
    /// 是否已暂停
    paused: watch::Sender<bool>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel_token: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            paused,
        }
    }

    /// 触发停止
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 进程退出时的取消
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();
    }

    fn cancel_reason(&self) -> Interrupt {
        if self.shutting_down.load(Ordering::SeqCst) {
            Interrupt::Shutdown
        } else {
            Interrupt::Stopped
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// 设置暂停标志，状态未变化时不唤醒等待者
    pub fn set_paused(&self, paused: bool) {
        self.paused.send_if_modified(|current| {
            let changed = *current != paused;
            *current = paused;
            changed
        });
    }

    /// 当前中断状态（stop 优先）
    pub fn interruption(&self) -> Option<Interrupt> {
        if self.is_cancelled() {
            Some(self.cancel_reason())
        } else if self.is_paused() {
            Some(Interrupt::Paused)
        } else {
            None
        }
    }

    /// 等待直到被暂停或停止
    pub async fn interrupted(&self) -> Interrupt {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => self.cancel_reason(),
            _ = paused.wait_for(|p| *p) => Interrupt::Paused,
        }
    }

    /// 暂停门：暂停期间不返回；恢复后返回 true，停止则返回 false
    ///
    /// 除了恢复通知外，每隔 `poll` 也会重新检查一次。
    pub async fn wait_until_runnable(&self, poll: Duration) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return false,
                _ = paused.changed() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// 执行 future，停止时提前返回 None
    pub async fn run_cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// 可被停止打断的睡眠，返回是否完整睡完
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.run_cancellable(tokio::time::sleep(duration)).await.is_some()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
