//! 会话日志与状态提交
//!
//! 活动日志先落库再推送；状态转移以 compare-and-set 提交，
//! 并在会话级转移闸内发出日志与 status_change，保证观察者看到的顺序与提交顺序一致。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::gateway::{EventBus, SessionEvent};
use crate::store::{LogEntry, LogLevel, RecordStore, Session, SessionStatus, StoreError};

use super::error::{EngineError, TransitionError};
use super::state::{self, SessionCommand, Transition};

/// 每个命令对应的日志
fn transition_log(command: SessionCommand) -> (LogLevel, &'static str) {
    match command {
        SessionCommand::Start => (LogLevel::Info, "Automation started"),
        SessionCommand::Pause => (LogLevel::Warning, "Automation paused"),
        SessionCommand::Resume => (LogLevel::Info, "Automation resumed"),
        SessionCommand::Stop => (LogLevel::Warning, "Automation stopped"),
        SessionCommand::Complete => (LogLevel::Success, "Automation completed"),
        SessionCommand::Abort => (LogLevel::Error, "Automation failed"),
    }
}

/// 会话日志：存储 + 事件总线 + 转移闸
pub struct SessionJournal {
    store: Arc<dyn RecordStore>,
    bus: EventBus,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionJournal {
    pub fn new(store: Arc<dyn RecordStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn gate(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.gates
                .lock()
                .await
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    /// 持有会话转移闸；持有期间该会话不会发生状态转移
    pub async fn hold(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.gate(session_id).await.lock_owned().await
    }

    /// 推送事件（不落库）
    pub async fn publish(&self, session_id: &str, event: SessionEvent) {
        self.bus.publish(session_id, event).await;
    }

    /// 追加一条活动日志并推送
    pub async fn log(
        &self,
        session_id: &str,
        level: LogLevel,
        title: impl Into<String>,
        description: Option<String>,
    ) -> Result<LogEntry, StoreError> {
        let entry = LogEntry::new(session_id, level, title, description);
        self.record(&entry).await?;
        Ok(entry)
    }

    pub async fn record(&self, entry: &LogEntry) -> Result<(), StoreError> {
        self.store.append_log(entry).await?;
        self.bus.publish(&entry.session_id, SessionEvent::from(entry)).await;
        Ok(())
    }

    /// 提交状态转移
    ///
    /// 返回 `Some(新状态)`；幂等命令返回 `None`，此时不写库、不记日志、不推送。
    pub async fn transition(
        &self,
        session_id: &str,
        command: SessionCommand,
        description: Option<String>,
    ) -> Result<Option<SessionStatus>, EngineError> {
        let _held = self.hold(session_id).await;

        let session = self.load(session_id).await?;
        let next = match state::apply(session.status, command)? {
            Transition::Unchanged => return Ok(None),
            Transition::Changed(next) => next,
        };

        if command == SessionCommand::Start {
            check_startable(&session)?;
        }

        if !self
            .store
            .compare_and_set_status(session_id, session.status, next)
            .await?
        {
            return Err(TransitionError::Conflict {
                expected: session.status,
            }
            .into());
        }

        tracing::info!(session_id, %command, from = %session.status, to = %next, "Session transition");

        let (level, title) = transition_log(command);
        self.log(session_id, level, title, description).await?;
        self.bus
            .publish(session_id, SessionEvent::StatusChange { status: next })
            .await;

        Ok(Some(next))
    }

    pub async fn load(&self, session_id: &str) -> Result<Session, EngineError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }
}

fn check_startable(session: &Session) -> Result<(), TransitionError> {
    if session.total_items == 0 {
        return Err(TransitionError::EmptyQueue);
    }
    if !session.has_background() {
        return Err(TransitionError::MissingBackground);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Contact, MemoryRecordStore, SessionConfig};

    async fn journal_with_session(background: Option<&str>, contacts: usize) -> (SessionJournal, String) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let session = Session::new(SessionConfig::default());
        store.create_session(&session).await.unwrap();
        let contacts = (0..contacts)
            .map(|i| Contact {
                first_name: format!("C{}", i),
                last_name: "X".into(),
                profile_url: format!("https://example.com/in/{}", i),
                ..Default::default()
            })
            .collect();
        store
            .apply_upload(&session.id, background.map(String::from), contacts)
            .await
            .unwrap();
        (SessionJournal::new(store, EventBus::new(16)), session.id)
    }

    #[tokio::test]
    async fn test_start_requires_queue_and_background() {
        let (journal, id) = journal_with_session(Some("bg"), 0).await;
        let err = journal.transition(&id, SessionCommand::Start, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Transition(TransitionError::EmptyQueue)));

        let (journal, id) = journal_with_session(Some("   "), 2).await;
        let err = journal.transition(&id, SessionCommand::Start, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Transition(TransitionError::MissingBackground)));
        assert_eq!(journal.load(&id).await.unwrap().status, SessionStatus::Idle);
        assert!(journal.store().list_logs(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_logs_then_publishes_status() {
        let (journal, id) = journal_with_session(Some("bg"), 1).await;
        let mut rx = journal.bus().attach(&id).await;

        let next = journal.transition(&id, SessionCommand::Start, None).await.unwrap();
        assert_eq!(next, Some(SessionStatus::Running));

        match rx.recv().await {
            Some(SessionEvent::Log { title, level, .. }) => {
                assert_eq!(title, "Automation started");
                assert_eq!(level, LogLevel::Info);
            }
            other => panic!("expected log, got {:?}", other),
        }
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::StatusChange {
                status: SessionStatus::Running
            })
        );
    }

    #[tokio::test]
    async fn test_idempotent_command_is_silent() {
        let (journal, id) = journal_with_session(Some("bg"), 1).await;
        journal.transition(&id, SessionCommand::Start, None).await.unwrap();
        journal.transition(&id, SessionCommand::Pause, None).await.unwrap();
        let before = journal.store().list_logs(&id).await.unwrap().len();

        assert_eq!(journal.transition(&id, SessionCommand::Pause, None).await.unwrap(), None);
        assert_eq!(journal.store().list_logs(&id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (journal, _) = journal_with_session(None, 0).await;
        assert!(matches!(
            journal.transition("session_missing", SessionCommand::Stop, None).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }
}
