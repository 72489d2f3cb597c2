//! Agent 过程事件：阶段切换、思考、工具调用、审批、计划步骤、上下文裁剪
//!
//! 通过可选的无界通道推送给 UI；发送失败（接收端已关闭）直接忽略。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::Phase;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 生命周期阶段切换
    PhaseChanged { phase: Phase },
    /// 子循环迭代计数
    StepUpdate { iteration: usize, max_iterations: usize },
    /// 正在调用模型
    Thinking,
    /// 模型回复预览
    ThinkingContent { text: String },
    /// 流式回复的一小段
    MessageChunk { text: String },
    /// 流式回复结束
    MessageDone,
    /// 解析到工具调用
    ToolCall {
        id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 工具执行失败（非致命，已写入上下文）
    ToolFailure { tool: String, reason: String },
    /// 工具调用等待人工审批
    ApprovalRequired {
        id: String,
        tool: String,
        action: String,
        destructive: bool,
    },
    /// 审批已处理
    ApprovalResolved { id: String, approved: bool },
    /// 从回复中提取出计划
    PlanCreated { steps: Vec<String> },
    StepStarted { id: usize, description: String },
    StepCompleted { id: usize },
    StepFailed { id: usize, error: String },
    /// 上下文裁剪
    ContextPruned { pruned: usize, summary: String },
    /// 单次模型调用的 token 用量
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    /// 错误
    Error { text: String },
}

pub(crate) fn send_event(tx: Option<&UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 按字符截断，超出时追加 "..."
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
