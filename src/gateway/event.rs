//! 会话事件协议
//!
//! 引擎推送给观察者的 JSON 帧：`{"type": <name>, "data": {...}}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{LogEntry, LogLevel, SessionStatus};

/// 会话事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 活动日志
    Log {
        level: LogLevel,
        title: String,
        description: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// 会话状态变更
    StatusChange { status: SessionStatus },

    /// 开始处理某个联系人
    CurrentItem {
        name: String,
        position: Option<String>,
        company: Option<String>,
        locator: String,
    },

    /// 消息草拟完成
    MessageReady { text: String },

    /// 倒计时开始
    CountdownStart { duration: u32 },

    /// 倒计时剩余秒数
    CountdownTick { remaining: u32 },

    /// 进度
    ProgressUpdate { processed: u32, remaining: u32 },

    /// 上传完成
    #[serde(rename_all = "camelCase")]
    UploadComplete {
        background_present: bool,
        contact_count: u32,
    },
}

impl SessionEvent {
    /// 事件名（即线上 `type` 字段）
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Log { .. } => "log",
            SessionEvent::StatusChange { .. } => "status_change",
            SessionEvent::CurrentItem { .. } => "current_item",
            SessionEvent::MessageReady { .. } => "message_ready",
            SessionEvent::CountdownStart { .. } => "countdown_start",
            SessionEvent::CountdownTick { .. } => "countdown_tick",
            SessionEvent::ProgressUpdate { .. } => "progress_update",
            SessionEvent::UploadComplete { .. } => "upload_complete",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&LogEntry> for SessionEvent {
    fn from(entry: &LogEntry) -> Self {
        SessionEvent::Log {
            level: entry.level,
            title: entry.title.clone(),
            description: entry.description.clone(),
            timestamp: entry.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = SessionEvent::ProgressUpdate {
            processed: 2,
            remaining: 1,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "progress_update");
        assert_eq!(value["data"]["processed"], 2);
        assert_eq!(value["data"]["remaining"], 1);
        assert_eq!(event.kind(), "progress_update");
    }

    #[test]
    fn test_status_and_upload_fields() {
        let status = serde_json::to_value(SessionEvent::StatusChange {
            status: SessionStatus::Paused,
        })
        .unwrap();
        assert_eq!(status["type"], "status_change");
        assert_eq!(status["data"]["status"], "paused");

        let upload = serde_json::to_value(SessionEvent::UploadComplete {
            background_present: true,
            contact_count: 3,
        })
        .unwrap();
        assert_eq!(upload["type"], "upload_complete");
        assert_eq!(upload["data"]["backgroundPresent"], true);
        assert_eq!(upload["data"]["contactCount"], 3);
    }
}
