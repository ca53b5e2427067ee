//! 集成测试共用：可编排的假操作面与编排器装配

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use reach::actuation::{ActuationError, Actuator, ActuatorFactory, ProfileFacts};
use reach::config::SessionSection;
use reach::core::Orchestrator;
use reach::gateway::{EventBus, SessionEvent};
use reach::ingest::UploadedFile;
use reach::llm::DraftingService;
use reach::store::{DelayRange, MemoryRecordStore, RecordStore, SessionConfig, SessionStatus};

/// 假操作面的行为脚本
#[derive(Default)]
pub struct Script {
    pub launch_error: Option<String>,
    /// locator → 打开失败原因
    pub open_failures: HashMap<String, String>,
    /// locator → 资料页信息
    pub facts: HashMap<String, ProfileFacts>,
    pub open_delay: Duration,
}

/// 记录所有调用，按脚本返回
#[derive(Clone, Default)]
pub struct ScriptedActuators {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedActuators {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl ActuatorFactory for ScriptedActuators {
    async fn launch(&self) -> Result<Box<dyn Actuator>, ActuationError> {
        self.push("launch");
        if let Some(reason) = self.script.lock().unwrap().launch_error.clone() {
            return Err(ActuationError::Launch(reason));
        }
        Ok(Box::new(ScriptedActuator {
            owner: self.clone(),
        }))
    }
}

struct ScriptedActuator {
    owner: ScriptedActuators,
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn open(&mut self, locator: &str) -> Result<ProfileFacts, ActuationError> {
        self.owner.push(format!("open {}", locator));
        let (delay, failure, facts) = {
            let script = self.owner.script.lock().unwrap();
            (
                script.open_delay,
                script.open_failures.get(locator).cloned(),
                script.facts.get(locator).cloned(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(reason) => Err(ActuationError::Navigation {
                locator: locator.to_string(),
                reason,
            }),
            None => Ok(facts.unwrap_or_default()),
        }
    }

    async fn open_compose(&mut self) -> Result<(), ActuationError> {
        self.owner.push("open_compose");
        Ok(())
    }

    async fn inject(&mut self, text: &str) -> Result<(), ActuationError> {
        self.owner.push(format!("inject {}", text.len()));
        Ok(())
    }

    async fn confirm_send(&mut self) -> Result<(), ActuationError> {
        self.owner.push("confirm_send");
        Ok(())
    }

    async fn close_surface(&mut self) -> Result<(), ActuationError> {
        self.owner.push("close_surface");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ActuationError> {
        self.owner.push("shutdown");
        Ok(())
    }
}

/// 零间隔、5 秒倒计时的会话默认值
pub fn settings() -> SessionSection {
    SessionSection {
        countdown_secs: 5,
        connection_delay: DelayRange::new(0, 0),
        auto_send: true,
        pause_poll_ms: 1000,
        stop_grace_secs: 10,
    }
}

pub fn orchestrator_with(
    store: Arc<dyn RecordStore>,
    actuators: &ScriptedActuators,
    drafting: DraftingService,
) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        store,
        EventBus::new(1024),
        Arc::new(actuators.clone()),
        drafting,
        settings(),
    ))
}

pub fn orchestrator(actuators: &ScriptedActuators) -> Arc<Orchestrator> {
    orchestrator_with(
        Arc::new(MemoryRecordStore::new()),
        actuators,
        DraftingService::template_only(),
    )
}

pub fn locator(first: &str) -> String {
    format!("https://example.com/in/{}", first.to_lowercase())
}

/// (名, 姓, 公司) → 联系人 CSV
pub fn connections_csv(rows: &[(&str, &str, &str)]) -> UploadedFile {
    let mut body = String::from("First Name,Last Name,URL,Email Address,Company,Position,Connected On\n");
    for (first, last, company) in rows {
        body.push_str(&format!("{},{},{},,{},Engineer,01 Jan 2024\n", first, last, locator(first), company));
    }
    UploadedFile::new("connections.csv", body.into_bytes())
}

/// 创建会话并上传背景与联系人
pub async fn ready_session(
    orchestrator: &Orchestrator,
    config: SessionConfig,
    rows: &[(&str, &str, &str)],
) -> String {
    let session = orchestrator.create_session(config).await.unwrap();
    orchestrator
        .upload(
            &session.id,
            Some(UploadedFile::new("resume.txt", "Rust engineer building data tools")),
            Some(connections_csv(rows)),
        )
        .await
        .unwrap();
    session.id
}

/// 收集事件直到会话进入给定状态
pub async fn events_until(
    rx: &mut mpsc::Receiver<SessionEvent>,
    status: SessionStatus,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = event == SessionEvent::StatusChange { status };
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// 等待事件满足条件
pub async fn wait_for(
    rx: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = pred(&event);
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// 等待循环退出
pub async fn wait_idle(orchestrator: &Orchestrator, session_id: &str) {
    for _ in 0..1000 {
        if !orchestrator.is_active(session_id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session loop for {} did not exit", session_id);
}

pub fn ticks(events: &[SessionEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::CountdownTick { remaining } => Some(*remaining),
            _ => None,
        })
        .collect()
}
