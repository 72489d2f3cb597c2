//! LLM 层：客户端抽象、错误分类、重试装饰器与实现（OpenAI 兼容 / Mock / Scripted）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod token_stats;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{classify_error, OpenAiClient};
pub use retry::{RetryConfig, RetryingLlmClient};
pub use token_stats::{format_token_count, TokenStats, TokenTracker};
pub use traits::{CompletionRequest, CompletionResponse, LlmClient, LlmError, LlmStream, Usage};
