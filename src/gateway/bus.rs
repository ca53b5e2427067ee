//! 会话事件总线
//!
//! 每个会话至多一个观察者；发布永不阻塞引擎：队列满则丢弃，观察者断开则解除挂载。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::sync::mpsc::error::TrySendError;

use super::event::SessionEvent;
use crate::store::SessionId;

/// 按会话分发事件
#[derive(Clone)]
pub struct EventBus {
    observers: Arc<RwLock<HashMap<SessionId, mpsc::Sender<SessionEvent>>>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Arc::new(RwLock::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// 挂载观察者，替换该会话已有的观察者
    pub async fn attach(&self, session_id: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let previous = self
            .observers
            .write()
            .await
            .insert(session_id.to_string(), tx);
        if previous.is_some() {
            tracing::debug!(session_id, "Replaced existing observer");
        }
        rx
    }

    /// 观察者断开后调用；只移除已关闭的发送端，不影响之后挂载的新观察者
    pub async fn detach(&self, session_id: &str) {
        let mut observers = self.observers.write().await;
        if observers.get(session_id).map(|tx| tx.is_closed()).unwrap_or(false) {
            observers.remove(session_id);
        }
    }

    /// 发布事件；无观察者时静默丢弃
    pub async fn publish(&self, session_id: &str, event: SessionEvent) {
        let result = {
            let observers = self.observers.read().await;
            match observers.get(session_id) {
                Some(tx) => tx.try_send(event),
                None => return,
            }
        };

        match result {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(session_id, kind = event.kind(), "Observer queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                let mut observers = self.observers.write().await;
                if observers.get(session_id).map(|tx| tx.is_closed()).unwrap_or(false) {
                    observers.remove(session_id);
                    tracing::debug!(session_id, "Observer disconnected, detached");
                }
            }
        }
    }

    pub async fn has_observer(&self, session_id: &str) -> bool {
        self.observers.read().await.contains_key(session_id)
    }
}
