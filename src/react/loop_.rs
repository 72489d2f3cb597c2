//! 请求/工具调用子循环
//!
//! 调用模型 -> 回复写入上下文 -> 解析 `<tool_use>` -> 逐个交给 ToolExecutor：
//! 需要审批的调用挂起并立即返回；工具错误写入上下文后继续；有工具真正执行过才进入下一轮。
//! 迭代次数有上限，超过即为致命错误。

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::CompletionRequest;
use crate::memory::{ContextManager, Message};
use crate::react::events::{preview, send_event};
use crate::react::{extract_tool_calls, AgentEvent, Planner};
use crate::tools::{ApprovalRequest, ToolCall, ToolExecutor, ToolResult};

/// 单次子循环的默认最大迭代数
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 子循环结果
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// 最后一次模型回复
    pub message: String,
    pub tool_calls: Vec<ToolCall>,
    /// 已执行（非挂起）的工具结果
    pub tool_results: Vec<ToolResult>,
    /// 等待审批的调用；非空时 done 为 false
    pub pending: Vec<(ToolCall, ApprovalRequest)>,
    pub done: bool,
}

impl TurnOutcome {
    pub fn requires_approval(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// 子循环所需的协作者
pub struct ReactSession<'a> {
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub context: &'a ContextManager,
    pub cancel_token: CancellationToken,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<AgentEvent>>,
    pub max_iterations: usize,
    /// 是否使用流式回复
    pub stream: bool,
}

impl<'a> ReactSession<'a> {
    pub fn new(
        planner: &'a Planner,
        executor: &'a ToolExecutor,
        context: &'a ContextManager,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            executor,
            context,
            cancel_token,
            event_tx: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stream: false,
        }
    }

    pub fn with_event_tx(mut self, tx: Option<&'a UnboundedSender<AgentEvent>>) -> Self {
        self.event_tx = tx;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// 调用模型一次；流式时在当前任务上逐块消费
async fn complete(session: &ReactSession<'_>, request: &CompletionRequest) -> Result<String, AgentError> {
    let cancel = &session.cancel_token;
    if !session.stream {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            r = session.planner.complete(request) => r?,
        };
        if response.usage.total_tokens > 0 {
            send_event(
                session.event_tx,
                AgentEvent::TokenUsage {
                    prompt_tokens: response.usage.prompt_tokens,
                    completion_tokens: response.usage.completion_tokens,
                    total_tokens: response.usage.total_tokens,
                },
            );
        }
        return Ok(response.content);
    }

    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
        s = session.planner.stream(request) => s?,
    };
    let mut text = String::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            n = stream.next() => n,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        send_event(session.event_tx, AgentEvent::MessageChunk { text: chunk.clone() });
        text.push_str(&chunk);
    }
    send_event(session.event_tx, AgentEvent::MessageDone);
    Ok(text)
}

/// 运行子循环直到：无工具调用、遇到审批、无工具真正执行，或出错
pub async fn run_turn(session: &ReactSession<'_>) -> Result<TurnOutcome, AgentError> {
    let ctx = session.context;
    let event_tx = session.event_tx;
    let mut outcome = TurnOutcome::default();

    for iteration in 0..session.max_iterations {
        send_event(
            event_tx,
            AgentEvent::StepUpdate {
                iteration,
                max_iterations: session.max_iterations,
            },
        );
        if session.cancel_token.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let request = session
            .planner
            .build_request(ctx.messages(), session.executor.definitions());
        send_event(event_tx, AgentEvent::Thinking);
        let reply = complete(session, &request).await?;

        ctx.add_message(Message::assistant(reply.clone()));
        send_event(
            event_tx,
            AgentEvent::ThinkingContent {
                text: preview(&reply, THINKING_PREVIEW_CHARS),
            },
        );
        outcome.message = reply;

        let calls = extract_tool_calls(&outcome.message);
        if calls.is_empty() {
            outcome.done = true;
            return Ok(outcome);
        }

        let mut executed = 0;
        for call in &calls {
            send_event(
                event_tx,
                AgentEvent::ToolCall {
                    id: call.id.clone(),
                    tool: call.name.clone(),
                    args: call.arguments_value(),
                },
            );
            match session.executor.execute(call, &session.cancel_token).await {
                Ok(ToolResult {
                    approval: Some(request),
                    ..
                }) => outcome.pending.push((call.clone(), request)),
                Ok(result) => {
                    ctx.add_message(Message::user(format!(
                        "Tool {} result:\n{}",
                        call.name, result.output
                    )));
                    send_event(
                        event_tx,
                        AgentEvent::Observation {
                            tool: call.name.clone(),
                            preview: preview(&result.output, OBSERVATION_PREVIEW_CHARS),
                        },
                    );
                    outcome.tool_results.push(result);
                    executed += 1;
                }
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(tool = %call.name, "tool failed: {}", e);
                    ctx.add_message(Message::user(format!("Tool {} failed: {}", call.name, e)));
                    send_event(
                        event_tx,
                        AgentEvent::ToolFailure {
                            tool: call.name.clone(),
                            reason: e.to_string(),
                        },
                    );
                }
                Err(e) => return Err(e),
            }
        }
        outcome.tool_calls.extend(calls);

        if outcome.requires_approval() {
            outcome.done = false;
            return Ok(outcome);
        }
        if executed == 0 {
            outcome.done = true;
            return Ok(outcome);
        }
    }

    tracing::warn!(max = session.max_iterations, "agent loop exhausted");
    Err(AgentError::LoopExhausted {
        max_iterations: session.max_iterations,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::Role;
    use crate::tools::{EchoTool, ToolRegistry};

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        ToolExecutor::new(registry, 5)
    }

    #[tokio::test]
    async fn test_tool_result_feeds_next_iteration() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"<tool_use>{"name": "echo", "arguments": {"text": "hi"}}</tool_use>"#,
            "All done.",
        ]));
        let planner = Planner::new(llm.clone(), "sys");
        let exec = executor();
        let ctx = ContextManager::new();
        ctx.add_message(Message::user("say hi"));

        let session = ReactSession::new(&planner, &exec, &ctx, CancellationToken::new());
        let out = run_turn(&session).await.unwrap();

        assert!(out.done);
        assert_eq!(out.message, "All done.");
        assert_eq!(out.tool_results.len(), 1);
        let msgs = ctx.messages();
        assert_eq!(msgs[2], Message::user("Tool echo result:\nhi"));
        assert_eq!(msgs.last().map(|m| m.role), Some(Role::Assistant));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recorded_and_turn_ends() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"<tool_use>{"name": "nope", "arguments": {}}</tool_use>"#,
        ]));
        let planner = Planner::new(llm.clone(), "");
        let exec = executor();
        let ctx = ContextManager::new();

        let out = run_turn(&ReactSession::new(&planner, &exec, &ctx, CancellationToken::new()))
            .await
            .unwrap();
        assert!(out.done);
        assert!(out.tool_results.is_empty());
        let last = ctx.messages().pop().unwrap();
        assert!(last.content.starts_with("Tool nope failed:"));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_loop_exhaustion_is_fatal() {
        let llm = Arc::new(
            ScriptedLlmClient::new(Vec::<String>::new())
                .then_repeat(r#"<tool_use>{"name": "echo", "arguments": {"text": "again"}}</tool_use>"#),
        );
        let planner = Planner::new(llm.clone(), "");
        let exec = executor();
        let ctx = ContextManager::new();
        let session =
            ReactSession::new(&planner, &exec, &ctx, CancellationToken::new()).with_max_iterations(3);

        let err = run_turn(&session).await.unwrap_err();
        assert!(matches!(err, AgentError::LoopExhausted { max_iterations: 3 }));
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_model_call() {
        let llm = Arc::new(ScriptedLlmClient::new(["unused"]));
        let planner = Planner::new(llm.clone(), "");
        let exec = executor();
        let ctx = ContextManager::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = run_turn(&ReactSession::new(&planner, &exec, &ctx, token)).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_streaming_emits_chunks() {
        let llm = Arc::new(ScriptedLlmClient::new(["plain answer"]));
        let planner = Planner::new(llm, "");
        let exec = executor();
        let ctx = ContextManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ReactSession::new(&planner, &exec, &ctx, CancellationToken::new())
            .with_event_tx(Some(&tx))
            .with_streaming(true);

        let out = run_turn(&session).await.unwrap();
        assert_eq!(out.message, "plain answer");

        let mut chunks = String::new();
        let mut saw_done = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                AgentEvent::MessageChunk { text } => chunks.push_str(&text),
                AgentEvent::MessageDone => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(chunks, "plain answer");
        assert!(saw_done);
    }
}
