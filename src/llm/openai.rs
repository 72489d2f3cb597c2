//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；传输层错误按文本特征映射到 LlmError 分类。
//! 工具以 `<tool_use>` 文本协议写在 system prompt 中，这里不使用原生 function calling。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, LlmStream, Usage};
use crate::memory::{Message, Role};

/// 按错误文本归类（async_openai 的错误只在文本里带出 HTTP 状态）
pub fn classify_error(message: impl Into<String>) -> LlmError {
    let message = message.into();
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["401", "403", "unauthorized", "invalid api key", "incorrect api key", "authentication"]) {
        LlmError::Auth(message)
    } else if has(&["429", "rate limit", "rate_limit", "too many requests"]) {
        LlmError::RateLimited {
            message,
            retry_after_ms: None,
        }
    } else if has(&["timed out", "timeout"]) {
        LlmError::Timeout(message)
    } else if has(&["400", "invalid_request", "invalid request", "invalid argument", "context length"]) {
        LlmError::InvalidRequest(message)
    } else if let Some(status) = ["500", "502", "503", "504"]
        .iter()
        .find(|s| lower.contains(*s))
        .and_then(|s| s.parse().ok())
    {
        LlmError::Server { status, message }
    } else if has(&["overloaded", "server error", "internal error"]) {
        LlmError::Server {
            status: 500,
            message,
        }
    } else if has(&["connect", "connection", "dns", "network", "broken pipe", "reset by peer"]) {
        LlmError::Network(message)
    } else {
        LlmError::Unknown(message)
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_openai_message(m: &Message) -> Result<ChatCompletionRequestMessage, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidRequest(e.to_string());
        Ok(match m.role {
            Role::System => ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(invalid)?,
            ),
            Role::User => ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(invalid)?,
            ),
            Role::Assistant => ChatCompletionRequestMessage::Assistant(
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map_err(invalid)?,
            ),
        })
    }

    fn build_request(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, LlmError> {
        let messages = request
            .messages
            .iter()
            .map(Self::to_openai_message)
            .collect::<Result<Vec<_>, _>>()?;
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(request.temperature)
            .max_completion_tokens(request.max_tokens)
            .stream(stream)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let req = self.build_request(request, false)?;
        let response = self
            .client
            .chat()
            .create(req)
            .await
            .map_err(|e| classify_error(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens as u64,
                completion_tokens: u.completion_tokens as u64,
                total_tokens: u.total_tokens as u64,
            })
            .unwrap_or_default();

        let choice = response.choices.first();
        Ok(CompletionResponse {
            content: choice
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default(),
            finish_reason: choice
                .and_then(|c| c.finish_reason.as_ref())
                .map(|r| format!("{:?}", r).to_lowercase()),
            usage,
        })
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<LlmStream, LlmError> {
        let req = self.build_request(request, true)?;
        let stream = self
            .client
            .chat()
            .create_stream(req)
            .await
            .map_err(|e| classify_error(e.to_string()))?;

        let deltas = stream.filter_map(|item| async move {
            match item {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .filter_map(|c| c.delta.content)
                    .reduce(|a, b| a + &b)
                    .map(Ok),
                Err(e) => Some(Err(classify_error(e.to_string()))),
            }
        });
        Ok(Box::pin(deltas))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
