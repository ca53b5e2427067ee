//! 会话编排器：命令面
//!
//! 负责：创建会话、处理上传、执行 start/pause/resume/stop/patch 命令，
//! 并维护活动处理循环的注册表（每个会话至多一个循环）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::actuation::ActuatorFactory;
use crate::config::SessionSection;
use crate::gateway::{EventBus, SessionEvent};
use crate::ingest::{extract_background_text, parse_contact_list, UploadedFile};
use crate::llm::DraftingService;
use crate::store::{
    LogEntry, LogLevel, RecordStore, Session, SessionConfig, SessionId, SessionPatch,
    SessionSnapshot, SessionStatus, UploadSummary,
};

use super::error::{EngineError, TransitionError};
use super::journal::SessionJournal;
use super::pipeline::{LoopExit, SessionLoop};
use super::session_supervisor::SessionSupervisor;
use super::state::SessionCommand;

/// 已挂载的处理循环
struct ActiveLoop {
    supervisor: Arc<SessionSupervisor>,
    handle: JoinHandle<LoopExit>,
    generation: u64,
}

type Registry = Arc<Mutex<HashMap<SessionId, ActiveLoop>>>;

/// 会话编排器
pub struct Orchestrator {
    journal: Arc<SessionJournal>,
    actuators: Arc<dyn ActuatorFactory>,
    drafting: DraftingService,
    settings: SessionSection,
    active: Registry,
    next_generation: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        bus: EventBus,
        actuators: Arc<dyn ActuatorFactory>,
        drafting: DraftingService,
        settings: SessionSection,
    ) -> Self {
        Self {
            journal: Arc::new(SessionJournal::new(store, bus)),
            actuators,
            drafting,
            settings,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.journal.store()
    }

    /// 创建会话，未给出的配置取 [session] 默认值
    pub async fn create_session(&self, mut config: SessionConfig) -> Result<Session, EngineError> {
        config.countdown_secs.get_or_insert(self.settings.countdown_secs);
        config.connection_delay.get_or_insert(self.settings.connection_delay);
        config.auto_send.get_or_insert(self.settings.auto_send);
        config.api_key = config.api_key.filter(|k| !k.trim().is_empty());
        validate_countdown(config.countdown_secs)?;

        let session = Session::new(config);
        self.store().create_session(&session).await?;
        self.journal
            .log(&session.id, LogLevel::Info, "Session created", None)
            .await?;

        tracing::info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// 上传背景文档与联系人列表
    ///
    /// 只在 idle 时接受；两个文件都解析成功后才写入，失败则什么都不创建。
    /// 状态检查与写入都在转移闸内，期间 start 无法插入。
    pub async fn upload(
        &self,
        session_id: &str,
        resume: Option<UploadedFile>,
        connections: Option<UploadedFile>,
    ) -> Result<UploadSummary, EngineError> {
        let _held = self.journal.hold(session_id).await;
        let session = self.journal.load(session_id).await?;
        if session.status != SessionStatus::Idle {
            return Err(TransitionError::UploadLocked {
                status: session.status,
            }
            .into());
        }
        if resume.is_none() && connections.is_none() {
            return Err(EngineError::Validation("No files uploaded".to_string()));
        }

        let background = resume.as_ref().map(extract_background_text).transpose()?;
        let contacts = connections.as_ref().map(parse_contact_list).transpose()?;
        let contact_count = contacts.as_ref().map(|c| c.len() as u32).unwrap_or(0);

        let updated = self
            .store()
            .apply_upload(session_id, background, contacts.unwrap_or_default())
            .await?;

        if let Some(file) = &resume {
            self.journal
                .log(
                    session_id,
                    LogLevel::Success,
                    "Resume uploaded",
                    Some(format!("Loaded background from {}", file.file_name)),
                )
                .await?;
        }
        if connections.is_some() {
            self.journal
                .log(
                    session_id,
                    LogLevel::Success,
                    "Connections uploaded",
                    Some(format!("{} connections loaded", contact_count)),
                )
                .await?;
        }

        let summary = UploadSummary {
            background_present: updated.has_background(),
            contact_count,
            total_items: updated.total_items,
        };
        self.journal
            .publish(
                session_id,
                SessionEvent::UploadComplete {
                    background_present: summary.background_present,
                    contact_count,
                },
            )
            .await;

        tracing::info!(session_id, contact_count, total = summary.total_items, "Upload applied");
        Ok(summary)
    }

    /// idle → running，并挂载处理循环
    pub async fn start(&self, session_id: &str) -> Result<(), EngineError> {
        let mut active = self.active.lock().await;
        self.journal
            .transition(session_id, SessionCommand::Start, None)
            .await?;
        self.spawn_loop(session_id, &mut active);
        Ok(())
    }

    /// running → paused；循环在当前条目结束后停在暂停门
    pub async fn pause(&self, session_id: &str) -> Result<(), EngineError> {
        let active = self.active.lock().await;
        if self
            .journal
            .transition(session_id, SessionCommand::Pause, None)
            .await?
            .is_some()
        {
            if let Some(entry) = active.get(session_id) {
                entry.supervisor.set_paused(true);
            }
        }
        Ok(())
    }

    /// paused → running；没有存活循环时（例如进程重启后）重新挂载一个
    pub async fn resume(&self, session_id: &str) -> Result<(), EngineError> {
        let mut active = self.active.lock().await;
        if self
            .journal
            .transition(session_id, SessionCommand::Resume, None)
            .await?
            .is_none()
        {
            return Ok(());
        }

        match active.get(session_id) {
            Some(entry) if !entry.handle.is_finished() => entry.supervisor.set_paused(false),
            _ => {
                let reverted = self.store().reset_processing(session_id).await?;
                if reverted > 0 {
                    tracing::info!(session_id, reverted, "Returned stranded items to queue");
                }
                self.spawn_loop(session_id, &mut active);
            }
        }
        Ok(())
    }

    /// running|paused → stopped；等待循环退出（最多 stop_grace）以释放操作面
    pub async fn stop(&self, session_id: &str) -> Result<(), EngineError> {
        let (entry, result) = {
            let mut active = self.active.lock().await;
            let entry = active.remove(session_id);
            if let Some(entry) = &entry {
                entry.supervisor.cancel();
            }
            let result = self
                .journal
                .transition(session_id, SessionCommand::Stop, None)
                .await;
            (entry, result)
        };

        if let Some(entry) = entry {
            self.await_exit(session_id, entry).await;
        }
        result.map(|_| ())
    }

    /// 合并部分配置，从下一个条目开始生效
    pub async fn patch(&self, session_id: &str, mut patch: SessionPatch) -> Result<Session, EngineError> {
        validate_countdown(patch.countdown_secs)?;
        if patch.sender_background.is_some() {
            // 背景属于上传内容，开始后不再修改
            let session = self.journal.load(session_id).await?;
            if session.status != SessionStatus::Idle {
                patch.sender_background = None;
            }
        }
        let session = self.store().patch_session(session_id, patch).await?;
        tracing::info!(session_id, "Session configuration updated");
        Ok(session)
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, EngineError> {
        let session = self.journal.load(session_id).await?;
        let items = self.store().list_items(session_id).await?;
        let logs = self.store().list_logs(session_id).await?;
        let is_active = self.is_active(session_id).await;
        Ok(SessionSnapshot {
            session,
            items,
            logs,
            is_active,
        })
    }

    pub async fn logs(&self, session_id: &str) -> Result<Vec<LogEntry>, EngineError> {
        self.journal.load(session_id).await?;
        Ok(self.store().list_logs(session_id).await?)
    }

    /// 挂载观察者（替换已有观察者）
    pub async fn observe(&self, session_id: &str) -> Result<mpsc::Receiver<SessionEvent>, EngineError> {
        self.journal.load(session_id).await?;
        Ok(self.journal.bus().attach(session_id).await)
    }

    /// 观察者断开后解除挂载
    pub async fn release_observer(&self, session_id: &str) {
        self.journal.bus().detach(session_id).await;
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .await
            .get(session_id)
            .map(|entry| !entry.handle.is_finished())
            .unwrap_or(false)
    }

    /// 进程退出前停止所有循环，会话状态保持不变，下次启动由 `recover` 转为 paused
    ///
    /// 处理到一半（含倒计时中）的条目退回 pending。
    pub async fn shutdown_all(&self) -> usize {
        let entries: Vec<(SessionId, ActiveLoop)> = self.active.lock().await.drain().collect();
        let count = entries.len();
        for (_, entry) in &entries {
            entry.supervisor.shutdown();
        }
        for (session_id, entry) in entries {
            self.await_exit(&session_id, entry).await;
        }
        if count > 0 {
            tracing::info!("Stopped {} session loops", count);
        }
        count
    }

    /// 启动时恢复：上次进程遗留的 running 会话转为 paused，processing 条目退回 pending
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;
        for session in self.store().list_sessions().await? {
            if !matches!(session.status, SessionStatus::Running | SessionStatus::Paused) {
                continue;
            }
            if self.is_active(&session.id).await {
                continue;
            }
            if session.status == SessionStatus::Running {
                self.journal
                    .transition(
                        &session.id,
                        SessionCommand::Pause,
                        Some("Interrupted by a restart; resume to continue".to_string()),
                    )
                    .await?;
            }
            self.store().reset_processing(&session.id).await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!("Recovered {} interrupted sessions as paused", recovered);
        }
        Ok(recovered)
    }

    fn spawn_loop(&self, session_id: &str, active: &mut HashMap<SessionId, ActiveLoop>) {
        let supervisor = Arc::new(SessionSupervisor::new());
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session_loop = SessionLoop::new(
            session_id,
            Arc::clone(&self.journal),
            Arc::clone(&supervisor),
            Arc::clone(&self.actuators),
            self.drafting.clone(),
            self.settings.pause_poll(),
        );

        let registry = Arc::clone(&self.active);
        let id = session_id.to_string();
        let handle = tokio::spawn(async move {
            let exit = session_loop.run().await;
            let mut active = registry.lock().await;
            if active.get(&id).map(|e| e.generation == generation).unwrap_or(false) {
                active.remove(&id);
            }
            if let Err(e) = exit.clone().into_result() {
                tracing::warn!(session_id = %id, "{}", e);
            }
            exit
        });

        active.insert(
            session_id.to_string(),
            ActiveLoop {
                supervisor,
                handle,
                generation,
            },
        );
    }

    async fn await_exit(&self, session_id: &str, entry: ActiveLoop) {
        match tokio::time::timeout(self.settings.stop_grace(), entry.handle).await {
            Ok(Ok(exit)) => tracing::debug!(session_id, ?exit, "Session loop joined"),
            Ok(Err(e)) => tracing::error!(session_id, "Session loop panicked: {}", e),
            Err(_) => tracing::warn!(
                session_id,
                "Session loop did not exit within {:?}",
                self.settings.stop_grace()
            ),
        }
    }
}

impl LoopExit {
    pub fn into_result(self) -> Result<(), EngineError> {
        match self {
            LoopExit::Failed(reason) => Err(EngineError::LoopFatal(reason)),
            LoopExit::Completed | LoopExit::Stopped => Ok(()),
        }
    }
}

fn validate_countdown(countdown: Option<u32>) -> Result<(), EngineError> {
    match countdown {
        Some(0) => Err(EngineError::Validation(
            "Countdown must be at least 1 second".to_string(),
        )),
        _ => Ok(()),
    }
}
