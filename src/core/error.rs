//! 引擎错误类型
//!
//! 命令面的错误（校验、非法转移、会话不存在）不改变状态；LoopFatal 会让会话进入 stopped。

use thiserror::Error;

use crate::ingest::IngestError;
use crate::store::{SessionStatus, StoreError};

use super::state::SessionCommand;

/// 非法的状态转移
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot {command} a session that is {from}")]
    Illegal {
        from: SessionStatus,
        command: SessionCommand,
    },

    #[error("No connections uploaded")]
    EmptyQueue,

    #[error("Resume/background is required before starting")]
    MissingBackground,

    #[error("Uploads are only accepted before the session starts (session is {status})")]
    UploadLocked { status: SessionStatus },

    /// 提交时状态已被其他转移改变
    #[error("Session status changed concurrently (expected {expected})")]
    Conflict { expected: SessionStatus },
}

/// 命令面错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Automation failed: {0}")]
    LoopFatal(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionNotFound(id) => EngineError::SessionNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<IngestError> for EngineError {
    fn from(e: IngestError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
