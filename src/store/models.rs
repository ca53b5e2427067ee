//! 记录模型：会话、队列条目、活动日志
//!
//! 三类实体只通过 session_id 外键关联；存储层是唯一写入方，编排器是唯一发起状态变更的一方。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 会话 ID
pub type SessionId = String;

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 条目间隔范围（秒），线上格式为 "min-max"
///
/// min > max 时退化为固定间隔 min。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DelayRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl DelayRange {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }

    /// 实际采样区间（毫秒，闭区间）
    pub fn bounds_ms(&self) -> (u64, u64) {
        let min = self.min_secs.saturating_mul(1000);
        let max = self.max_secs.saturating_mul(1000).max(min);
        (min, max)
    }
}

impl Default for DelayRange {
    fn default() -> Self {
        Self::new(2, 6)
    }
}

impl FromStr for DelayRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| format!("Invalid delay range '{}': expected \"min-max\" in whole seconds", s))
        };
        match s.split_once('-') {
            Some((min, max)) => Ok(Self::new(parse(min)?, parse(max)?)),
            None => {
                let v = parse(s)?;
                Ok(Self::new(v, v))
            }
        }
    }
}

impl TryFrom<String> for DelayRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DelayRange> for String {
    fn from(value: DelayRange) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min_secs, self.max_secs)
    }
}

/// 外联会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    /// 发件人背景（简历文本）
    pub sender_background: Option<String>,
    /// 额外草拟要求
    pub extra_guidance: Option<String>,
    /// 草拟服务凭据，不回传给客户端
    #[serde(skip_serializing, default)]
    pub api_key: Option<String>,
    pub auto_send: bool,
    pub countdown_secs: u32,
    pub connection_delay: DelayRange,
    pub total_items: u32,
    pub processed_items: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            status: SessionStatus::Idle,
            sender_background: config.sender_background,
            extra_guidance: config.extra_guidance,
            api_key: config.api_key,
            auto_send: config.auto_send.unwrap_or(true),
            countdown_secs: config.countdown_secs.unwrap_or(5),
            connection_delay: config.connection_delay.unwrap_or_default(),
            total_items: 0,
            processed_items: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 是否已有非空的发件人背景
    pub fn has_background(&self) -> bool {
        self.sender_background
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn remaining_items(&self) -> u32 {
        self.total_items.saturating_sub(self.processed_items)
    }

    /// 合并部分配置（不涉及状态）
    pub fn apply_patch(&mut self, patch: SessionPatch) {
        if let Some(v) = patch.sender_background {
            self.sender_background = Some(v);
        }
        if let Some(v) = patch.extra_guidance {
            self.extra_guidance = Some(v);
        }
        if let Some(v) = patch.api_key {
            self.api_key = Some(v).filter(|k| !k.trim().is_empty());
        }
        if let Some(v) = patch.auto_send {
            self.auto_send = v;
        }
        if let Some(v) = patch.countdown_secs {
            self.countdown_secs = v;
        }
        if let Some(v) = patch.connection_delay {
            self.connection_delay = v;
        }
    }
}

/// 创建会话时的初始配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sender_background: Option<String>,
    pub extra_guidance: Option<String>,
    pub api_key: Option<String>,
    pub auto_send: Option<bool>,
    pub countdown_secs: Option<u32>,
    pub connection_delay: Option<DelayRange>,
}

/// 会话的部分更新
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionPatch {
    pub sender_background: Option<String>,
    pub extra_guidance: Option<String>,
    pub api_key: Option<String>,
    pub auto_send: Option<bool>,
    pub countdown_secs: Option<u32>,
    pub connection_delay: Option<DelayRange>,
}

/// 队列条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Sent,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Sent => "sent",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 联系人（来自上传的联系人列表）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub first_name: String,
    pub last_name: String,
    pub profile_url: String,
    pub email: Option<String>,
    pub company: Option<String>,
    /// 职位名称
    pub position: Option<String>,
    pub connected_on: Option<String>,
}

impl Contact {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// 队列条目：一个联系人及其处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub session_id: SessionId,
    /// 创建序号，由存储层分配，会话内严格递增
    pub seq: u64,
    #[serde(flatten)]
    pub contact: Contact,
    pub status: ItemStatus,
    pub generated_message: Option<String>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(session_id: &str, contact: Contact) -> Self {
        Self {
            id: format!("item_{}", uuid::Uuid::new_v4()),
            session_id: session_id.to_string(),
            seq: 0,
            contact,
            status: ItemStatus::Pending,
            generated_message: None,
            error_message: None,
            processed_at: None,
        }
    }

    /// 记录最终结果；生成的消息只写入一次
    pub fn resolve(&mut self, status: ItemStatus, message: Option<String>, error: Option<String>) {
        self.status = status;
        if self.generated_message.is_none() {
            self.generated_message = message;
        }
        if status == ItemStatus::Failed {
            self.error_message = error;
        }
        self.processed_at = Some(Utc::now());
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "success" => Some(Self::Success),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// 活动日志（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub session_id: SessionId,
    pub level: LogLevel,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        session_id: &str,
        level: LogLevel,
        title: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            id: format!("log_{}", uuid::Uuid::new_v4()),
            session_id: session_id.to_string(),
            level,
            title: title.into(),
            description,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// 上传结果摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub background_present: bool,
    /// 本次上传新增的联系人数
    pub contact_count: u32,
    pub total_items: u32,
}

/// 会话完整快照
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: Session,
    /// 按创建顺序
    pub items: Vec<QueueItem>,
    /// 按时间顺序
    pub logs: Vec<LogEntry>,
    /// 是否有处理循环在运行
    pub is_active: bool,
}
