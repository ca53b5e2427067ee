//! 记录存储
//!
//! 会话、队列条目、活动日志的持久化接口，支持内存和 SQLite 两种实现

pub mod memory;
pub mod models;

#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryRecordStore;
pub use models::{
    Contact, DelayRange, ItemStatus, LogEntry, LogLevel, QueueItem, Session, SessionConfig,
    SessionId, SessionPatch, SessionSnapshot, SessionStatus, UploadSummary,
};

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteRecordStore;

/// 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// 记录存储接口
///
/// 所有方法对并发调用安全；`claim_next_pending` 与 `compare_and_set_status` 是原子的。
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 保存新会话
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// 仅当当前状态为 `expected` 时写入 `next`，返回是否写入
    async fn compare_and_set_status(
        &self,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool, StoreError>;

    /// 合并部分配置，返回更新后的会话
    async fn patch_session(&self, session_id: &str, patch: SessionPatch)
        -> Result<Session, StoreError>;

    /// 一次性写入上传结果：可选的背景文本与一批联系人（全部成功或全部不写）
    async fn apply_upload(
        &self,
        session_id: &str,
        background: Option<String>,
        contacts: Vec<Contact>,
    ) -> Result<Session, StoreError>;

    /// 已处理数加一（不超过总数），返回 (processed, total)
    async fn record_processed(&self, session_id: &str) -> Result<(u32, u32), StoreError>;

    /// 按创建顺序列出条目
    async fn list_items(&self, session_id: &str) -> Result<Vec<QueueItem>, StoreError>;

    /// 原子地取出最早的 pending 条目并标记为 processing
    async fn claim_next_pending(&self, session_id: &str) -> Result<Option<QueueItem>, StoreError>;

    /// 写回条目的状态与结果
    async fn update_item(&self, item: &QueueItem) -> Result<(), StoreError>;

    /// 将遗留的 processing 条目恢复为 pending，返回恢复数量
    async fn reset_processing(&self, session_id: &str) -> Result<u32, StoreError>;

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError>;

    /// 按时间顺序列出日志
    async fn list_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError>;
}

/// 创建记录存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite 存储；否则使用内存存储
pub async fn create_record_store(db_path: Option<&std::path::Path>) -> Arc<dyn RecordStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteRecordStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite record store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent record store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory record store");
    Arc::new(MemoryRecordStore::new())
}
