//! 内存记录存储

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::models::{
    Contact, ItemStatus, LogEntry, QueueItem, Session, SessionId, SessionPatch, SessionStatus,
};
use super::{RecordStore, StoreError};

struct SessionRecord {
    session: Session,
    items: Vec<QueueItem>,
    logs: Vec<LogEntry>,
    next_seq: u64,
}

/// 内存记录存储，进程退出即丢失
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(session_id: &str) -> StoreError {
    StoreError::SessionNotFound(session_id.to_string())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.records.write().await.insert(
            session.id.clone(),
            SessionRecord {
                session: session.clone(),
                items: Vec::new(),
                logs: Vec::new(),
                next_seq: 1,
            },
        );
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .map(|r| r.session.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let records = self.records.read().await;
        let mut sessions: Vec<Session> = records.values().map(|r| r.session.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn compare_and_set_status(
        &self,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        if record.session.status != expected {
            return Ok(false);
        }
        record.session.status = next;
        record.session.updated_at = Utc::now();
        Ok(true)
    }

    async fn patch_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<Session, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        record.session.apply_patch(patch);
        record.session.updated_at = Utc::now();
        Ok(record.session.clone())
    }

    async fn apply_upload(
        &self,
        session_id: &str,
        background: Option<String>,
        contacts: Vec<Contact>,
    ) -> Result<Session, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| not_found(session_id))?;

        if let Some(text) = background {
            record.session.sender_background = Some(text);
        }
        let added = contacts.len() as u32;
        for contact in contacts {
            let mut item = QueueItem::new(session_id, contact);
            item.seq = record.next_seq;
            record.next_seq += 1;
            record.items.push(item);
        }
        record.session.total_items += added;
        record.session.updated_at = Utc::now();
        Ok(record.session.clone())
    }

    async fn record_processed(&self, session_id: &str) -> Result<(u32, u32), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        let session = &mut record.session;
        session.processed_items = (session.processed_items + 1).min(session.total_items);
        session.updated_at = Utc::now();
        Ok((session.processed_items, session.total_items))
    }

    async fn list_items(&self, session_id: &str) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .map(|r| r.items.clone())
            .unwrap_or_default())
    }

    async fn claim_next_pending(&self, session_id: &str) -> Result<Option<QueueItem>, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        let next = record
            .items
            .iter_mut()
            .filter(|i| i.status == ItemStatus::Pending)
            .min_by_key(|i| i.seq);
        Ok(next.map(|item| {
            item.status = ItemStatus::Processing;
            item.clone()
        }))
    }

    async fn update_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&item.session_id)
            .ok_or_else(|| not_found(&item.session_id))?;
        let slot = record
            .items
            .iter_mut()
            .find(|i| i.id == item.id)
            .ok_or_else(|| StoreError::ItemNotFound(item.id.clone()))?;
        *slot = item.clone();
        Ok(())
    }

    async fn reset_processing(&self, session_id: &str) -> Result<u32, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        let mut count = 0;
        for item in record
            .items
            .iter_mut()
            .filter(|i| i.status == ItemStatus::Processing)
        {
            item.status = ItemStatus::Pending;
            count += 1;
        }
        Ok(count)
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&entry.session_id)
            .ok_or_else(|| not_found(&entry.session_id))?;
        record.logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let records = self.records.read().await;
        let mut logs = records
            .get(session_id)
            .map(|r| r.logs.clone())
            .unwrap_or_default();
        // 稳定排序，同一时间戳保持插入顺序
        logs.sort_by_key(|l| l.timestamp);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{LogLevel, SessionConfig};

    fn contact(first: &str) -> Contact {
        Contact {
            first_name: first.to_string(),
            last_name: "Doe".to_string(),
            profile_url: format!("https://example.com/in/{}", first.to_lowercase()),
            ..Default::default()
        }
    }

    async fn seeded() -> (MemoryRecordStore, String) {
        let store = MemoryRecordStore::new();
        let session = Session::new(SessionConfig::default());
        store.create_session(&session).await.unwrap();
        (store, session.id)
    }

    #[tokio::test]
    async fn test_claim_in_creation_order() {
        let (store, id) = seeded().await;
        store
            .apply_upload(&id, None, vec![contact("Ann"), contact("Bob")])
            .await
            .unwrap();

        let first = store.claim_next_pending(&id).await.unwrap().unwrap();
        assert_eq!(first.contact.first_name, "Ann");
        assert_eq!(first.status, ItemStatus::Processing);

        let second = store.claim_next_pending(&id).await.unwrap().unwrap();
        assert_eq!(second.contact.first_name, "Bob");
        assert!(second.seq > first.seq);

        assert!(store.claim_next_pending(&id).await.unwrap().is_none());
        assert_eq!(store.reset_processing(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_compare_and_set_status() {
        let (store, id) = seeded().await;
        assert!(store
            .compare_and_set_status(&id, SessionStatus::Idle, SessionStatus::Running)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_status(&id, SessionStatus::Idle, SessionStatus::Running)
            .await
            .unwrap());
        assert!(matches!(
            store
                .compare_and_set_status("missing", SessionStatus::Idle, SessionStatus::Running)
                .await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_processed_count_capped() {
        let (store, id) = seeded().await;
        store.apply_upload(&id, None, vec![contact("Ann")]).await.unwrap();
        assert_eq!(store.record_processed(&id).await.unwrap(), (1, 1));
        assert_eq!(store.record_processed(&id).await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_logs_keep_insertion_order() {
        let (store, id) = seeded().await;
        let first = LogEntry::new(&id, LogLevel::Info, "first", None);
        let mut second = LogEntry::new(&id, LogLevel::Info, "second", None);
        second.timestamp = first.timestamp;
        store.append_log(&first).await.unwrap();
        store.append_log(&second).await.unwrap();

        let titles: Vec<_> = store
            .list_logs(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.title)
            .collect();
        assert_eq!(titles, vec!["first", "second"]);
    }
}
