//! 核心编排层：状态机、会话监管、倒计时、处理循环、命令面与关闭

pub mod countdown;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod pipeline;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use countdown::{CountdownHandle, Expiry};
pub use error::{EngineError, TransitionError};
pub use journal::SessionJournal;
pub use orchestrator::Orchestrator;
pub use pipeline::{pick_delay, LoopExit, SendDecision, SessionLoop, SkipReason};
pub use session_supervisor::{Interrupt, SessionSupervisor};
pub use shutdown::{
    SessionLoopsCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use state::{SessionCommand, Transition};
