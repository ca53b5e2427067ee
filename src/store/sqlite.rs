//! SQLite 记录存储
//!
//! 会话、条目、日志落盘，服务重启后可通过 `Orchestrator::recover` 继续

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row};

use super::models::{
    Contact, DelayRange, ItemStatus, LogEntry, LogLevel, QueueItem, Session, SessionPatch,
    SessionStatus,
};
use super::{RecordStore, StoreError};

const SESSION_COLUMNS: &str = "id, status, sender_background, extra_guidance, api_key, auto_send, \
     countdown_secs, connection_delay, total_items, processed_items, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, session_id, seq, first_name, last_name, profile_url, email, \
     company, position, connected_on, status, generated_message, error_message, processed_at";

/// SQLite 记录存储
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reach_sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                sender_background TEXT,
                extra_guidance TEXT,
                api_key TEXT,
                auto_send INTEGER NOT NULL,
                countdown_secs INTEGER NOT NULL,
                connection_delay TEXT NOT NULL,
                total_items INTEGER NOT NULL DEFAULT 0,
                processed_items INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reach_items (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                profile_url TEXT NOT NULL,
                email TEXT,
                company TEXT,
                position TEXT,
                connected_on TEXT,
                status TEXT NOT NULL,
                generated_message TEXT,
                error_message TEXT,
                processed_at INTEGER,
                FOREIGN KEY (session_id) REFERENCES reach_sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reach_logs (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                level TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                metadata TEXT,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES reach_sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reach_items_session ON reach_items(session_id, status, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reach_logs_session ON reach_logs(session_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn require_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {}", ms)))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let status: String = row.get("status");
    let delay: String = row.get("connection_delay");
    Ok(Session {
        id: row.get("id"),
        status: SessionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("session status '{}'", status)))?,
        sender_background: row.get("sender_background"),
        extra_guidance: row.get("extra_guidance"),
        api_key: row.get("api_key"),
        auto_send: row.get::<i64, _>("auto_send") != 0,
        countdown_secs: row.get::<i64, _>("countdown_secs") as u32,
        connection_delay: delay
            .parse::<DelayRange>()
            .map_err(StoreError::Corrupt)?,
        total_items: row.get::<i64, _>("total_items") as u32,
        processed_items: row.get::<i64, _>("processed_items") as u32,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem, StoreError> {
    let status: String = row.get("status");
    let processed_at: Option<i64> = row.get("processed_at");
    Ok(QueueItem {
        id: row.get("id"),
        session_id: row.get("session_id"),
        seq: row.get::<i64, _>("seq") as u64,
        contact: Contact {
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            profile_url: row.get("profile_url"),
            email: row.get("email"),
            company: row.get("company"),
            position: row.get("position"),
            connected_on: row.get("connected_on"),
        },
        status: ItemStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("item status '{}'", status)))?,
        generated_message: row.get("generated_message"),
        error_message: row.get("error_message"),
        processed_at: processed_at.map(from_millis).transpose()?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<LogEntry, StoreError> {
    let level: String = row.get("level");
    let metadata: Option<String> = row.get("metadata");
    Ok(LogEntry {
        id: row.get("id"),
        session_id: row.get("session_id"),
        level: LogLevel::parse(&level)
            .ok_or_else(|| StoreError::Corrupt(format!("log level '{}'", level)))?,
        title: row.get("title"),
        description: row.get("description"),
        metadata: metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()?,
        timestamp: from_millis(row.get("timestamp"))?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO reach_sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SESSION_COLUMNS
        ))
        .bind(&session.id)
        .bind(session.status.as_str())
        .bind(&session.sender_background)
        .bind(&session.extra_guidance)
        .bind(&session.api_key)
        .bind(session.auto_send as i64)
        .bind(session.countdown_secs as i64)
        .bind(session.connection_delay.to_string())
        .bind(session.total_items as i64)
        .bind(session.processed_items as i64)
        .bind(to_millis(session.created_at))
        .bind(to_millis(session.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM reach_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reach_sessions ORDER BY created_at ASC",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn compare_and_set_status(
        &self,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE reach_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(to_millis(Utc::now()))
        .bind(session_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.require_session(session_id).await?;
        Ok(false)
    }

    async fn patch_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Session, StoreError> {
        // 只写补丁给出的列，并发补丁互不覆盖
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE reach_sessions SET updated_at = ");
        query.push_bind(to_millis(Utc::now()));
        if let Some(v) = patch.sender_background {
            query.push(", sender_background = ").push_bind(v);
        }
        if let Some(v) = patch.extra_guidance {
            query.push(", extra_guidance = ").push_bind(v);
        }
        if let Some(v) = patch.api_key {
            query
                .push(", api_key = ")
                .push_bind(Some(v).filter(|k| !k.trim().is_empty()));
        }
        if let Some(v) = patch.auto_send {
            query.push(", auto_send = ").push_bind(v as i64);
        }
        if let Some(v) = patch.countdown_secs {
            query.push(", countdown_secs = ").push_bind(v as i64);
        }
        if let Some(v) = patch.connection_delay {
            query.push(", connection_delay = ").push_bind(v.to_string());
        }
        query.push(" WHERE id = ").push_bind(session_id);
        query.build().execute(&self.pool).await?;

        self.require_session(session_id).await
    }

    async fn apply_upload(
        &self,
        session_id: &str,
        background: Option<String>,
        contacts: Vec<Contact>,
    ) -> Result<Session, StoreError> {
        self.require_session(session_id).await?;

        let mut tx = self.pool.begin().await?;
        let now = to_millis(Utc::now());

        if let Some(text) = &background {
            sqlx::query("UPDATE reach_sessions SET sender_background = ? WHERE id = ?")
                .bind(text)
                .bind(session_id)
                .execute(&mut *tx)
                .await?;
        }

        let next_seq: i64 = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) + 1 AS next_seq FROM reach_items WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?
        .get("next_seq");

        let added = contacts.len() as i64;
        for (offset, contact) in contacts.into_iter().enumerate() {
            let item = QueueItem::new(session_id, contact);
            sqlx::query(&format!(
                "INSERT INTO reach_items ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL)",
                ITEM_COLUMNS
            ))
            .bind(&item.id)
            .bind(session_id)
            .bind(next_seq + offset as i64)
            .bind(&item.contact.first_name)
            .bind(&item.contact.last_name)
            .bind(&item.contact.profile_url)
            .bind(&item.contact.email)
            .bind(&item.contact.company)
            .bind(&item.contact.position)
            .bind(&item.contact.connected_on)
            .bind(ItemStatus::Pending.as_str())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE reach_sessions SET total_items = total_items + ?, updated_at = ? WHERE id = ?",
        )
        .bind(added)
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.require_session(session_id).await
    }

    async fn record_processed(&self, session_id: &str) -> Result<(u32, u32), StoreError> {
        let row = sqlx::query(
            "UPDATE reach_sessions
             SET processed_items = MIN(processed_items + 1, total_items), updated_at = ?
             WHERE id = ?
             RETURNING processed_items, total_items",
        )
        .bind(to_millis(Utc::now()))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;

        let processed: i64 = row.get("processed_items");
        let total: i64 = row.get("total_items");
        Ok((processed as u32, total as u32))
    }

    async fn list_items(&self, session_id: &str) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM reach_items WHERE session_id = ? ORDER BY seq ASC",
            ITEM_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn claim_next_pending(&self, session_id: &str) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE reach_items SET status = 'processing'
             WHERE id = (
                 SELECT id FROM reach_items
                 WHERE session_id = ? AND status = 'pending'
                 ORDER BY seq ASC LIMIT 1
             )
             RETURNING {}",
            ITEM_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn update_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE reach_items
             SET status = ?, generated_message = ?, error_message = ?, processed_at = ?
             WHERE id = ?",
        )
        .bind(item.status.as_str())
        .bind(&item.generated_message)
        .bind(&item.error_message)
        .bind(item.processed_at.map(to_millis))
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(item.id.clone()));
        }
        Ok(())
    }

    async fn reset_processing(&self, session_id: &str) -> Result<u32, StoreError> {
        let result = sqlx::query(
            "UPDATE reach_items SET status = 'pending' WHERE session_id = ? AND status = 'processing'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO reach_logs (id, session_id, level, title, description, metadata, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.session_id)
        .bind(entry.level.as_str())
        .bind(&entry.title)
        .bind(&entry.description)
        .bind(metadata)
        .bind(to_millis(entry.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, level, title, description, metadata, timestamp
             FROM reach_logs WHERE session_id = ? ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}
