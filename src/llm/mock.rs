//! Mock / Scripted LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：取最后一条 User 消息，回显为 `<tool_use>` echo 调用；看到工具结果后给出最终回复
//! - ScriptedLlmClient：按顺序重放预置回复，并记录收到的请求

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError};
use crate::memory::Role;

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        if let Some(result) = last_user.strip_prefix("Tool echo result:\n") {
            return Ok(CompletionResponse::text(format!("Echo from Mock: {}", result)));
        }

        let call = serde_json::json!({ "name": "echo", "arguments": { "text": last_user } });
        Ok(CompletionResponse::text(format!(
            "Let me echo that.\n<tool_use>{}</tool_use>",
            call
        )))
    }

    fn model(&self) -> &str {
        "mock"
    }
}

/// 按顺序重放回复；用尽后若设置了 repeat 则一直返回它
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    repeat: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    pub fn from_results<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, LlmError>>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 脚本用尽后一直返回该回复
    pub fn then_repeat(mut self, reply: impl Into<String>) -> Self {
        self.repeat = Some(reply.into());
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        lock(&self.requests).push(request.clone());
        let next = lock(&self.replies).pop_front();
        match next {
            Some(reply) => reply.map(CompletionResponse::text),
            None => self
                .repeat
                .clone()
                .map(CompletionResponse::text)
                .ok_or_else(|| LlmError::Unknown("no scripted reply left".to_string())),
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    fn request(msgs: Vec<Message>) -> CompletionRequest {
        CompletionRequest {
            messages: msgs,
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 16,
            system_prompt: None,
        }
    }

    #[tokio::test]
    async fn test_mock_echoes_then_answers() {
        let first = MockLlmClient
            .complete(&request(vec![Message::user("ping")]))
            .await
            .unwrap();
        assert!(first.content.contains("<tool_use>"));
        assert!(first.content.contains("\"ping\""));

        let second = MockLlmClient
            .complete(&request(vec![Message::user("Tool echo result:\nping")]))
            .await
            .unwrap();
        assert_eq!(second.content, "Echo from Mock: ping");
    }

    #[tokio::test]
    async fn test_scripted_replays_in_order() {
        let client = ScriptedLlmClient::new(["a", "b"]).then_repeat("z");
        let req = request(vec![]);
        assert_eq!(client.complete(&req).await.unwrap().content, "a");
        assert_eq!(client.complete(&req).await.unwrap().content, "b");
        assert_eq!(client.complete(&req).await.unwrap().content, "z");
        assert_eq!(client.call_count(), 3);

        let empty = ScriptedLlmClient::new(Vec::<String>::new());
        assert!(empty.complete(&req).await.is_err());
    }
}
