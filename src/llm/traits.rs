//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 LlmClient：complete（非流式）、complete_stream（流式增量）。
//! 错误按 LlmError 分类：Auth 与 InvalidRequest 不可重试，其余由 RetryingLlmClient 指数退避重试。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::Serialize;
use thiserror::Error;

use crate::memory::Message;
use crate::tools::ToolDefinition;

/// 模型调用错误分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("{0}")]
    Unknown(String),
}

impl LlmError {
    /// Auth 与 InvalidRequest 重试无意义
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Auth(_) | LlmError::InvalidRequest(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Auth(_) => "auth",
            LlmError::RateLimited { .. } => "rate_limit",
            LlmError::InvalidRequest(_) => "invalid_request",
            LlmError::Timeout(_) => "timeout",
            LlmError::Network(_) => "network",
            LlmError::Server { .. } => "server",
            LlmError::Unknown(_) => "unknown",
        }
    }
}

/// 一次模型请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 由 Planner 作为首条 System 消息放入 messages；保留原文供后端按需处理
    pub system_prompt: Option<String>,
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 一次模型回复
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// 流式增量文本
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回增量文本流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// 流式完成；默认一次性返回完整回复
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<LlmStream, LlmError> {
        let response = self.complete(request).await?;
        Ok(Box::pin(stream::iter(vec![Ok(response.content)])))
    }

    /// 模型名（日志用）
    fn model(&self) -> &str {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(!LlmError::Auth("x".into()).is_retryable());
        assert!(!LlmError::InvalidRequest("x".into()).is_retryable());
        assert!(LlmError::Timeout("x".into()).is_retryable());
        assert!(LlmError::Network("x".into()).is_retryable());
        assert!(LlmError::Unknown("x".into()).is_retryable());
        assert!(LlmError::Server {
            status: 503,
            message: "x".into()
        }
        .is_retryable());
        assert!(LlmError::RateLimited {
            message: "x".into(),
            retry_after_ms: None
        }
        .is_retryable());
    }
}
