//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, ResponseFormat};
pub use traits::{
    extract_json_object, Completion, CompletionRequest, LlmClient, LlmError, OutputSchema,
    RetryConfig, RetryingLlmClient, ToolCall, ToolSpec,
};
