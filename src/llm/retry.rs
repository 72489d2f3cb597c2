//! 重试装饰器：对可重试的 LlmError 做指数退避
//!
//! 第 n 次重试前等待 `initial * multiplier^n`（不超过 max）；RateLimited 带 retry_after 时以其为准。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, LlmStream};

/// 重试参数（对应 [llm.retry]）
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待时间
    pub fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited {
            retry_after_ms: Some(ms),
            ..
        } = err
        {
            return Duration::from_millis((*ms).min(self.max_backoff_ms));
        }
        let ms = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

/// 带重试的 LlmClient 包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, LlmError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let wait = self.config.backoff(attempt, &e);
                    tracing::warn!(
                        kind = e.kind(),
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        "LLM call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.with_retry(|| self.inner.complete(request)).await
    }

    /// 只重试建立流的阶段；流开始后的错误原样交给调用方
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<LlmStream, LlmError> {
        self.with_retry(|| self.inner.complete_stream(request)).await
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 16,
            system_prompt: None,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = RetryConfig::default();
        let err = LlmError::Network("reset".into());
        assert_eq!(cfg.backoff(0, &err), Duration::from_millis(1000));
        assert_eq!(cfg.backoff(1, &err), Duration::from_millis(2000));
        assert_eq!(cfg.backoff(10, &err), Duration::from_millis(30_000));

        let limited = LlmError::RateLimited {
            message: "slow down".into(),
            retry_after_ms: Some(1500),
        };
        assert_eq!(cfg.backoff(0, &limited), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let scripted = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Server {
                status: 503,
                message: "overloaded".into(),
            }),
            Err(LlmError::Timeout("slow".into())),
            Ok("hello".into()),
        ]));
        let client = RetryingLlmClient::new(scripted.clone(), fast());
        let resp = client.complete(&request()).await.unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test]
    async fn test_auth_is_not_retried() {
        let scripted = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Auth("bad key".into())),
            Ok("never".into()),
        ]));
        let client = RetryingLlmClient::new(scripted.clone(), fast());
        let err = client.complete(&request()).await.unwrap_err();
        assert_eq!(err, LlmError::Auth("bad key".into()));
        assert_eq!(scripted.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let scripted = Arc::new(ScriptedLlmClient::from_results(vec![
            Err(LlmError::Network("down".into())),
            Err(LlmError::Network("down".into())),
            Err(LlmError::Network("still down".into())),
            Ok("too late".into()),
        ]));
        let client = RetryingLlmClient::new(scripted.clone(), fast());
        let err = client.complete(&request()).await.unwrap_err();
        assert_eq!(err, LlmError::Network("still down".into()));
        assert_eq!(scripted.call_count(), 3);
    }
}
