//! 逐条处理循环
//!
//! 每个运行中的会话一个循环：暂停门 → 取条目 → 打开资料页 → 草拟 → 填入 → 倒计时 → 发送或跳过 → 节奏延迟。
//! 同一会话同时最多一个条目处于 processing。

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;

use crate::actuation::{ActuationError, Actuator, ActuatorFactory};
use crate::gateway::SessionEvent;
use crate::llm::{DraftRequest, DraftingService};
use crate::store::{DelayRange, ItemStatus, LogEntry, LogLevel, QueueItem, Session, StoreError};

use super::countdown;
use super::error::EngineError;
use super::journal::SessionJournal;
use super::session_supervisor::{Interrupt, SessionSupervisor};
use super::state::SessionCommand;

pub const NO_HEADLINE: &str = "No headline available";
pub const NO_EMPLOYER: &str = "No company listed";

/// 跳过原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    Stopped,
    AutoSendDisabled,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::Paused => "Automation paused during countdown",
            SkipReason::Stopped => "Automation stopped during countdown",
            SkipReason::AutoSendDisabled => "Auto-send is disabled",
        }
    }
}

/// 倒计时窗口的结论，每次恰好一个
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Confirm,
    Skip(SkipReason),
    /// 进程退出：条目退回队列
    Requeue,
}

/// 单条目结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Skipped(SkipReason),
    Failed,
    /// 停止发生在倒计时之前，或进程退出：条目退回 pending，不计入进度
    Abandoned,
}

/// 循环退出方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    Stopped,
    Failed(String),
}

/// 一个会话的处理循环
pub struct SessionLoop {
    session_id: String,
    journal: Arc<SessionJournal>,
    supervisor: Arc<SessionSupervisor>,
    actuators: Arc<dyn ActuatorFactory>,
    drafting: DraftingService,
    pause_poll: Duration,
}

impl SessionLoop {
    pub fn new(
        session_id: impl Into<String>,
        journal: Arc<SessionJournal>,
        supervisor: Arc<SessionSupervisor>,
        actuators: Arc<dyn ActuatorFactory>,
        drafting: DraftingService,
        pause_poll: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            journal,
            supervisor,
            actuators,
            drafting,
            pause_poll,
        }
    }

    /// 运行到完成、停止或致命错误；任何退出路径都会释放操作面
    pub async fn run(self) -> LoopExit {
        let id = self.session_id.clone();
        tracing::info!(session_id = %id, "Session loop started");

        let launched = match self.supervisor.run_cancellable(self.actuators.launch()).await {
            None => return LoopExit::Stopped,
            Some(launched) => launched,
        };
        let mut actuator = match launched {
            Ok(actuator) => actuator,
            Err(e) => {
                tracing::error!(session_id = %id, "Actuator launch failed: {}", e);
                return self.abort(e.to_string()).await;
            }
        };

        let result = self.drive(actuator.as_mut()).await;

        if let Err(e) = actuator.shutdown().await {
            tracing::warn!(session_id = %id, "Actuator shutdown failed: {}", e);
        }

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(session_id = %id, "Session loop failed: {}", e);
                self.abort(e.to_string()).await
            }
        };
        tracing::info!(session_id = %id, exit = ?exit, "Session loop exited");
        exit
    }

    /// 致命错误：会话转入 stopped 并记录 error 日志
    async fn abort(&self, reason: String) -> LoopExit {
        match self
            .journal
            .transition(&self.session_id, SessionCommand::Abort, Some(reason.clone()))
            .await
        {
            Ok(_) => {}
            // 已被用户停止
            Err(EngineError::Transition(e)) => {
                tracing::debug!(session_id = %self.session_id, "Abort skipped: {}", e)
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, "Failed to record abort: {}", e)
            }
        }
        LoopExit::Failed(reason)
    }

    async fn drive(&self, actuator: &mut dyn Actuator) -> Result<LoopExit, StoreError> {
        let id = self.session_id.as_str();
        let store = self.journal.store();

        loop {
            if !self.supervisor.wait_until_runnable(self.pause_poll).await {
                return Ok(LoopExit::Stopped);
            }

            let Some(item) = store.claim_next_pending(id).await? else {
                match self.journal.transition(id, SessionCommand::Complete, None).await {
                    Ok(_) => return Ok(LoopExit::Completed),
                    // 暂停或停止与队列耗尽同时发生，回到暂停门
                    Err(EngineError::Transition(e)) => {
                        tracing::debug!(session_id = id, "Completion deferred: {}", e);
                        if self.supervisor.is_cancelled() {
                            return Ok(LoopExit::Stopped);
                        }
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(EngineError::Store(e)) => return Err(e),
                    Err(e) => return Err(StoreError::Database(e.to_string())),
                }
            };

            let session = store
                .get_session(id)
                .await?
                .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;

            let outcome = self.process_item(&session, item, actuator).await?;

            if let Err(e) = actuator.close_surface().await {
                tracing::warn!(session_id = id, "Failed to close page: {}", e);
            }

            if outcome == ItemOutcome::Abandoned {
                return Ok(LoopExit::Stopped);
            }

            let (processed, total) = store.record_processed(id).await?;
            self.journal
                .publish(
                    id,
                    SessionEvent::ProgressUpdate {
                        processed,
                        remaining: total.saturating_sub(processed),
                    },
                )
                .await;

            if !self.supervisor.is_cancelled() {
                self.supervisor.sleep(pick_delay(&session.connection_delay)).await;
            }
        }
    }

    async fn process_item(
        &self,
        session: &Session,
        mut item: QueueItem,
        actuator: &mut dyn Actuator,
    ) -> Result<ItemOutcome, StoreError> {
        let id = self.session_id.as_str();
        let name = item.contact.full_name();

        tracing::info!(session_id = id, item_id = %item.id, "Processing {}", name);

        self.journal
            .publish(
                id,
                SessionEvent::CurrentItem {
                    name: name.clone(),
                    position: item.contact.position.clone(),
                    company: item.contact.company.clone(),
                    locator: item.contact.profile_url.clone(),
                },
            )
            .await;
        self.journal
            .log(id, LogLevel::Info, format!("Opening profile: {}", name), None)
            .await?;

        let (outcome, message, error) = match self.stage_and_send(session, &item, actuator).await {
            Ok((SendDecision::Confirm, text)) => match actuator.confirm_send().await {
                Ok(()) => (ItemOutcome::Sent, Some(text), None),
                Err(e) => (ItemOutcome::Failed, Some(text), Some(e)),
            },
            Ok((SendDecision::Skip(reason), text)) => (ItemOutcome::Skipped(reason), Some(text), None),
            Ok((SendDecision::Requeue, _)) | Err(StageError::Cancelled) => {
                item.status = ItemStatus::Pending;
                self.journal.store().update_item(&item).await?;
                tracing::info!(session_id = id, item_id = %item.id, "Item returned to queue");
                return Ok(ItemOutcome::Abandoned);
            }
            Err(StageError::Actuation(e, text)) => (ItemOutcome::Failed, text, Some(e)),
            Err(StageError::Store(e)) => return Err(e),
        };

        let entry = match (outcome, &error) {
            (ItemOutcome::Sent, _) => {
                item.resolve(ItemStatus::Sent, message, None);
                LogEntry::new(id, LogLevel::Success, format!("Message sent to {}", name), None)
            }
            (ItemOutcome::Skipped(reason), _) => {
                item.resolve(ItemStatus::Skipped, message, None);
                LogEntry::new(
                    id,
                    LogLevel::Warning,
                    format!("Message cancelled for {}", name),
                    Some(reason.describe().to_string()),
                )
            }
            (_, err) => {
                let detail = err
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                item.resolve(ItemStatus::Failed, message, Some(detail.clone()));
                LogEntry::new(id, LogLevel::Error, format!("Failed to process {}", name), Some(detail))
            }
        };

        self.journal.store().update_item(&item).await?;
        self.journal
            .record(&entry.with_metadata(json!({
                "itemId": item.id,
                "status": item.status,
                "profileUrl": item.contact.profile_url,
            })))
            .await?;

        Ok(outcome)
    }

    /// 步骤 4–7：提取信息、草拟、填入、倒计时
    async fn stage_and_send(
        &self,
        session: &Session,
        item: &QueueItem,
        actuator: &mut dyn Actuator,
    ) -> Result<(SendDecision, String), StageError> {
        let id = self.session_id.as_str();
        let contact = &item.contact;
        let supervisor = &self.supervisor;

        let facts = supervisor
            .run_cancellable(actuator.open(&contact.profile_url))
            .await
            .ok_or(StageError::Cancelled)?
            .map_err(|e| StageError::Actuation(e, None))?;

        let headline = non_blank(facts.headline)
            .or_else(|| non_blank(contact.position.clone()))
            .unwrap_or_else(|| NO_HEADLINE.to_string());
        let employer = non_blank(facts.employer)
            .or_else(|| non_blank(contact.company.clone()))
            .unwrap_or_else(|| NO_EMPLOYER.to_string());

        let request = DraftRequest {
            background: session.sender_background.clone().unwrap_or_default(),
            target_name: contact.full_name(),
            headline,
            employer,
            guidance: session.extra_guidance.clone(),
        };
        let drafter = self.drafting.drafter_for(session.api_key.as_deref());
        let draft = supervisor
            .run_cancellable(drafter.draft(&request))
            .await
            .ok_or(StageError::Cancelled)?;
        let text = draft.text;

        self.journal
            .log(
                id,
                LogLevel::Info,
                "AI message generation",
                Some(format!("Drafted message for {} ({:?})", request.target_name, draft.source)),
            )
            .await
            .map_err(StageError::Store)?;
        self.journal
            .publish(id, SessionEvent::MessageReady { text: text.clone() })
            .await;

        let staged = supervisor
            .run_cancellable(async {
                actuator.open_compose().await?;
                actuator.inject(&text).await
            })
            .await
            .ok_or(StageError::Cancelled)?;
        if let Err(e) = staged {
            return Err(StageError::Actuation(e, Some(text)));
        }

        self.journal
            .log(id, LogLevel::Info, "Message ready - countdown started", None)
            .await
            .map_err(StageError::Store)?;

        let decision = self
            .send_window(session.countdown_secs.max(1), session.auto_send)
            .await;
        Ok((decision, text))
    }

    /// 倒计时窗口：计时与暂停/停止信号赛跑，自然结束后再检查一次
    pub(crate) async fn send_window(&self, duration: u32, auto_send: bool) -> SendDecision {
        let id = self.session_id.as_str();
        self.journal
            .publish(id, SessionEvent::CountdownStart { duration })
            .await;

        let mut countdown = countdown::start(duration);
        let interrupted = loop {
            tokio::select! {
                biased;
                reason = self.supervisor.interrupted() => {
                    countdown.cancel();
                    break Some(reason);
                }
                tick = countdown.next_tick() => match tick {
                    Some(remaining) => {
                        self.journal
                            .publish(id, SessionEvent::CountdownTick { remaining })
                            .await;
                    }
                    None => break None,
                }
            }
        };
        let expiry = countdown.finish().await;
        tracing::debug!(session_id = id, ?expiry, "Countdown finished");

        match interrupted.or_else(|| self.supervisor.interruption()) {
            Some(Interrupt::Stopped) => SendDecision::Skip(SkipReason::Stopped),
            Some(Interrupt::Paused) => SendDecision::Skip(SkipReason::Paused),
            Some(Interrupt::Shutdown) => SendDecision::Requeue,
            None if !auto_send => SendDecision::Skip(SkipReason::AutoSendDisabled),
            None => SendDecision::Confirm,
        }
    }
}

/// 暂存阶段的错误
enum StageError {
    /// 单条失败，附带已生成的消息
    Actuation(ActuationError, Option<String>),
    Store(StoreError),
    Cancelled,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// 在间隔范围内均匀取一个毫秒数
pub fn pick_delay(range: &DelayRange) -> Duration {
    let (min, max) = range.bounds_ms();
    let ms = if min == max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_delay_within_bounds() {
        let range = DelayRange::new(1, 2);
        for _ in 0..100 {
            let d = pick_delay(&range);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        }
        assert_eq!(pick_delay(&DelayRange::new(5, 1)), Duration::from_secs(5));
        assert_eq!(pick_delay(&DelayRange::new(0, 0)), Duration::ZERO);
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some(" CTO ".into())), Some("CTO".into()));
        assert_eq!(non_blank(None), None);
    }
}
