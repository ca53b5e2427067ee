//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），以及基于它的消息草拟

pub mod deepseek;
pub mod drafter;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use drafter::{Draft, DraftRequest, DraftSource, DraftingService, MessageDrafter};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::LlmClient;
