//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时。execute 先过审批闸门：工具声明需要确认时不执行，
//! 返回带 ApprovalRequest 的 ToolResult；execute_approved 供审批通过后直接执行。
//! 每次执行都受超时与调用方传入的 CancellationToken 约束，并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::tools::{Tool, ToolCall, ToolDefinition, ToolRegistry, ToolResult};

/// 工具执行器：审批闸门 + 超时 + 取消，结果映射为 ToolResult / AgentError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    fn lookup(&self, call: &ToolCall) -> Result<Arc<dyn Tool>, AgentError> {
        self.registry
            .get(&call.name)
            .ok_or_else(|| AgentError::ToolNotFound(call.name.clone()))
    }

    /// 经审批闸门执行：需确认的调用不执行，返回 needs_approval 结果
    pub async fn execute(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let tool = self.lookup(call)?;
        if let Some(request) = tool.approval_request(&call.arguments_value()) {
            tracing::info!(tool = %call.name, id = %call.id, "tool call requires approval");
            return Ok(ToolResult::needs_approval(&call.id, request));
        }
        self.run(tool, call, cancel).await
    }

    /// 审批已通过：绕过闸门直接执行
    pub async fn execute_approved(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let tool = self.lookup(call)?;
        self.run(tool, call, cancel).await
    }

    async fn run(
        &self,
        tool: Arc<dyn Tool>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let start = Instant::now();
        let args = call.arguments_value();
        let args_preview = args_preview(&args);

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            r = timeout(self.timeout, tool.execute(args)) => Some(r),
        };

        let (ok, outcome): (bool, &str) = match &result {
            Some(Ok(Ok(_))) => (true, "ok"),
            Some(Ok(Err(_))) => (false, "error"),
            Some(Err(_)) => (false, "timeout"),
            None => (false, "cancelled"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Some(Ok(Ok(output))) => Ok(ToolResult::ok(&call.id, output)),
            Some(Ok(Err(e))) => Err(AgentError::ToolExecutionFailed(e)),
            Some(Err(_)) => Err(AgentError::ToolTimeout(call.name.clone())),
            None => Err(AgentError::Cancelled),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
