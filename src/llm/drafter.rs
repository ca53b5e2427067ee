//! 消息草拟
//!
//! 有凭据时调用 LLM 生成个性化消息；无凭据、调用失败、超时或返回空文本时退化为确定性模板。

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;

use super::deepseek::create_deepseek_client;
use super::message::Message;
use super::openai::{OpenAiClient, OPENAI_DEFAULT_MODEL};
use super::traits::LlmClient;

/// 提示词中背景文本的最大字符数
pub const MAX_BACKGROUND_CHARS: usize = 1000;

const SYSTEM_PROMPT: &str = "You write short, personalized professional networking messages.\n\
Rules:\n\
- 50 to 150 words\n\
- Professional, friendly and sincere, never pushy or salesy\n\
- Refer to concrete details of the recipient's profile where it helps\n\
- Use the real names given, never placeholders such as [Name]\n\
- Close with a soft call to action\n\
Reply with the message body only, without a subject line or extra formatting.";

/// 草拟请求
#[derive(Debug, Clone, Default)]
pub struct DraftRequest {
    pub background: String,
    pub target_name: String,
    pub headline: String,
    pub employer: String,
    pub guidance: Option<String>,
}

impl DraftRequest {
    /// 称呼用的名字；姓名为空时用 "there"
    pub fn first_name(&self) -> &str {
        self.target_name.split_whitespace().next().unwrap_or("there")
    }
}

/// 消息来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftSource {
    Oracle,
    Template,
}

/// 草拟结果，文本保证非空
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub source: DraftSource,
}

/// 单个会话使用的草拟器
#[derive(Clone)]
pub struct MessageDrafter {
    client: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl MessageDrafter {
    pub fn new(client: Option<Arc<dyn LlmClient>>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// 只用模板，不调用 LLM
    pub fn template_only() -> Self {
        Self::new(None, Duration::from_secs(30))
    }

    pub fn has_oracle(&self) -> bool {
        self.client.is_some()
    }

    pub async fn draft(&self, request: &DraftRequest) -> Draft {
        let Some(client) = &self.client else {
            return Draft {
                text: intro_template(request),
                source: DraftSource::Template,
            };
        };

        let messages = build_prompt(request);
        let failure = match tokio::time::timeout(self.timeout, client.complete(&messages)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                return Draft {
                    text: text.trim().to_string(),
                    source: DraftSource::Oracle,
                }
            }
            Ok(Ok(_)) => "empty response".to_string(),
            Ok(Err(e)) => e,
            Err(_) => format!("timed out after {:?}", self.timeout),
        };

        tracing::warn!(target_name = %request.target_name, "Draft generation failed, using template: {}", failure);
        Draft {
            text: fallback_template(request),
            source: DraftSource::Template,
        }
    }
}

/// 构造 LLM 请求
pub fn build_prompt(request: &DraftRequest) -> Vec<Message> {
    let background: String = request.background.chars().take(MAX_BACKGROUND_CHARS).collect();
    let guidance = request
        .guidance
        .as_deref()
        .filter(|g| !g.trim().is_empty())
        .unwrap_or("Keep it professional and friendly");

    let user = format!(
        "Write a message to this person.\n\n\
         Recipient:\n\
         - Name: {}\n\
         - Headline: {}\n\
         - Company: {}\n\n\
         About me (sender):\n{}\n\n\
         Additional instructions: {}",
        request.target_name, request.headline, request.employer, background, guidance
    );

    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}

/// 无凭据时的模板
pub fn intro_template(request: &DraftRequest) -> String {
    format!(
        "Hi {},\n\nI noticed your background in {} and thought you might be interested in connecting. \
         I'd love to learn more about your experience in {}.\n\nLooking forward to connecting!\n\nBest regards",
        request.first_name(),
        request.employer,
        request.headline.to_lowercase()
    )
}

/// 调用失败时的模板
pub fn fallback_template(request: &DraftRequest) -> String {
    format!(
        "Hi {},\n\nI came across your profile and was impressed by your work at {}. \
         I'd love to connect and learn more about your experience in {}.\n\nBest regards",
        request.first_name(),
        request.employer,
        request.headline.to_lowercase()
    )
}

/// 按配置为会话构造草拟器
#[derive(Clone)]
pub struct DraftingService {
    settings: LlmSection,
    client_override: Option<Arc<dyn LlmClient>>,
    oracle_enabled: bool,
}

impl DraftingService {
    pub fn from_config(settings: &LlmSection) -> Self {
        Self {
            settings: settings.clone(),
            client_override: None,
            oracle_enabled: true,
        }
    }

    /// 忽略所有凭据，始终使用模板
    pub fn template_only() -> Self {
        Self {
            settings: LlmSection::default(),
            client_override: None,
            oracle_enabled: false,
        }
    }

    /// 所有会话共用给定客户端（测试或自定义后端）
    pub fn with_client(client: Arc<dyn LlmClient>, settings: &LlmSection) -> Self {
        Self {
            settings: settings.clone(),
            client_override: Some(client),
            oracle_enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeouts.request.max(1))
    }

    /// 会话自带的凭据优先于全局配置
    pub fn drafter_for(&self, session_key: Option<&str>) -> MessageDrafter {
        if let Some(client) = &self.client_override {
            return MessageDrafter::new(Some(Arc::clone(client)), self.timeout());
        }
        if !self.oracle_enabled {
            return MessageDrafter::new(None, self.timeout());
        }

        let key = session_key
            .filter(|k| !k.trim().is_empty())
            .map(String::from)
            .or_else(|| self.settings.resolve_api_key());

        let client: Option<Arc<dyn LlmClient>> = key.map(|key| {
            let client = match self.settings.provider.as_str() {
                "deepseek" => create_deepseek_client(self.settings.model.as_deref(), &key),
                _ => OpenAiClient::new(
                    self.settings.base_url.as_deref(),
                    self.settings.model.as_deref().unwrap_or(OPENAI_DEFAULT_MODEL),
                    &key,
                ),
            };
            Arc::new(client) as Arc<dyn LlmClient>
        });

        MessageDrafter::new(client, self.timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmClient;

    fn request() -> DraftRequest {
        DraftRequest {
            background: "x".repeat(5000),
            target_name: "Grace Hopper".into(),
            headline: "Compiler Engineer".into(),
            employer: "Navy Labs".into(),
            guidance: None,
        }
    }

    #[tokio::test]
    async fn test_template_without_credential() {
        let draft = MessageDrafter::template_only().draft(&request()).await;
        assert_eq!(draft.source, DraftSource::Template);
        assert!(draft.text.starts_with("Hi Grace,"));
        assert!(draft.text.contains("Navy Labs"));
        assert!(draft.text.contains("compiler engineer"));
    }

    #[tokio::test]
    async fn test_template_is_deterministic() {
        let drafter = MessageDrafter::template_only();
        let a = drafter.draft(&request()).await;
        let b = drafter.draft(&request()).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_empty_name_greets_there() {
        let mut req = request();
        req.target_name = "   ".into();
        let draft = MessageDrafter::template_only().draft(&req).await;
        assert!(draft.text.starts_with("Hi there,"));
    }

    #[tokio::test]
    async fn test_oracle_reply_trimmed() {
        let client = Arc::new(MockLlmClient::replying("  Hello Grace!  \n"));
        let drafter = MessageDrafter::new(Some(client.clone()), Duration::from_secs(5));
        let draft = drafter.draft(&request()).await;
        assert_eq!(draft.text, "Hello Grace!");
        assert_eq!(draft.source, DraftSource::Oracle);

        let sent = client.requests();
        assert_eq!(sent.len(), 1);
        let prompt = &sent[0][1].content;
        assert!(prompt.contains("Grace Hopper"));
        assert!(prompt.contains(&"x".repeat(MAX_BACKGROUND_CHARS)));
        assert!(!prompt.contains(&"x".repeat(MAX_BACKGROUND_CHARS + 1)));
        assert!(prompt.contains("Keep it professional and friendly"));
    }

    #[tokio::test]
    async fn test_failure_and_blank_fall_back() {
        for client in [MockLlmClient::failing("quota exceeded"), MockLlmClient::replying("   ")] {
            let drafter = MessageDrafter::new(Some(Arc::new(client)), Duration::from_secs(5));
            let draft = drafter.draft(&request()).await;
            assert_eq!(draft.source, DraftSource::Template);
            assert!(draft.text.contains("impressed by your work at Navy Labs"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back() {
        let drafter = MessageDrafter::new(
            Some(Arc::new(MockLlmClient::hanging())),
            Duration::from_secs(2),
        );
        let draft = drafter.draft(&request()).await;
        assert_eq!(draft.source, DraftSource::Template);
        assert!(!draft.text.is_empty());
    }

    #[test]
    fn test_session_key_enables_oracle() {
        let settings = LlmSection {
            api_key: None,
            provider: "openai".into(),
            ..Default::default()
        };
        let service = DraftingService::from_config(&settings);
        assert!(service.drafter_for(Some("sk-session")).has_oracle());
        assert!(service.drafter_for(Some("sk-session")).timeout == Duration::from_secs(30));
    }
}
