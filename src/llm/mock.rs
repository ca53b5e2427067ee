//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按预设脚本回复，并记录收到的每次请求，便于断言提示词内容。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::message::Message;
use super::traits::LlmClient;

#[derive(Debug, Clone)]
enum Script {
    Reply(String),
    Fail(String),
    Hang,
}

/// Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    script: Script,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    /// 总是返回给定文本
    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_script(Script::Reply(text.into()))
    }

    /// 总是返回错误
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_script(Script::Fail(reason.into()))
    }

    /// 永不返回（测试超时）
    pub fn hanging() -> Self {
        Self::with_script(Script::Hang)
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的请求
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        match &self.script {
            Script::Reply(text) => Ok(text.clone()),
            Script::Fail(reason) => Err(reason.clone()),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err("mock hang elapsed".to_string())
            }
        }
    }
}
