//! 会话状态机
//!
//! idle → running ⇄ paused → stopped | completed。状态本身只存于记录存储，这里只给出转移规则。

use std::fmt;

use crate::store::SessionStatus;

use super::error::TransitionError;

/// 驱动状态转移的命令（前四个来自用户，后两个由引擎发起）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Pause,
    Resume,
    Stop,
    /// 队列耗尽
    Complete,
    /// 循环致命错误
    Abort,
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionCommand::Start => "start",
            SessionCommand::Pause => "pause",
            SessionCommand::Resume => "resume",
            SessionCommand::Stop => "stop",
            SessionCommand::Complete => "complete",
            SessionCommand::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// 转移结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 需要提交的新状态
    Changed(SessionStatus),
    /// 幂等命令，无需写入、日志或事件
    Unchanged,
}

/// 计算命令在当前状态下的结果
pub fn apply(from: SessionStatus, command: SessionCommand) -> Result<Transition, TransitionError> {
    use SessionCommand as C;
    use SessionStatus as S;

    let next = match (from, command) {
        (S::Idle, C::Start) => S::Running,
        (S::Running, C::Pause) => S::Paused,
        (S::Paused, C::Resume) => S::Running,
        (S::Running | S::Paused, C::Stop) => S::Stopped,
        (S::Running, C::Complete) => S::Completed,
        (S::Running | S::Paused, C::Abort) => S::Stopped,

        (S::Paused, C::Pause) | (S::Running, C::Resume) | (S::Stopped, C::Stop) => {
            return Ok(Transition::Unchanged)
        }

        (from, command) => return Err(TransitionError::Illegal { from, command }),
    };
    Ok(Transition::Changed(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionCommand as C;
    use SessionStatus as S;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(apply(S::Idle, C::Start).unwrap(), Transition::Changed(S::Running));
        assert_eq!(apply(S::Running, C::Pause).unwrap(), Transition::Changed(S::Paused));
        assert_eq!(apply(S::Paused, C::Resume).unwrap(), Transition::Changed(S::Running));
        assert_eq!(apply(S::Running, C::Stop).unwrap(), Transition::Changed(S::Stopped));
        assert_eq!(apply(S::Paused, C::Stop).unwrap(), Transition::Changed(S::Stopped));
        assert_eq!(apply(S::Running, C::Complete).unwrap(), Transition::Changed(S::Completed));
        assert_eq!(apply(S::Paused, C::Abort).unwrap(), Transition::Changed(S::Stopped));
    }

    #[test]
    fn test_idempotent_commands() {
        assert_eq!(apply(S::Paused, C::Pause).unwrap(), Transition::Unchanged);
        assert_eq!(apply(S::Running, C::Resume).unwrap(), Transition::Unchanged);
        assert_eq!(apply(S::Stopped, C::Stop).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn test_illegal_transitions() {
        for (from, command) in [
            (S::Running, C::Start),
            (S::Paused, C::Start),
            (S::Stopped, C::Start),
            (S::Idle, C::Pause),
            (S::Idle, C::Resume),
            (S::Idle, C::Stop),
            (S::Completed, C::Stop),
            (S::Completed, C::Resume),
            (S::Stopped, C::Resume),
            (S::Paused, C::Complete),
        ] {
            assert!(
                matches!(apply(from, command), Err(TransitionError::Illegal { .. })),
                "{} on {} should be rejected",
                command,
                from
            );
        }
    }
}
