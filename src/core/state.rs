//! 状态投影：UiState
//!
//! UI 只持有轻量的 UiState；Agent 内部状态（上下文、生命周期、审批）由命令循环投影到这里，
//! 通过 watch 通道发布。

use serde::Serialize;

use crate::core::approval::ApprovalItem;
use crate::core::lifecycle::{Phase, PlanStep};
use crate::memory::Message;

/// 命令循环的运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AgentStatus {
    Idle,
    Thinking,
    AwaitingApproval,
    Error,
}

/// UI 看到的「投影」状态，轻量且易于渲染
#[derive(Clone, Debug, Serialize)]
pub struct UiState {
    pub status: AgentStatus,
    pub phase: Phase,
    pub history: Vec<Message>,
    pub plan: Vec<PlanStep>,
    /// 计划完成百分比
    pub progress: u8,
    pub pending_approvals: Vec<ApprovalItem>,
    /// 最近一次回复文本
    pub last_message: Option<String>,
    pub input_locked: bool,
    pub error_message: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            status: AgentStatus::Idle,
            phase: Phase::Understand,
            history: Vec::new(),
            plan: Vec::new(),
            progress: 0,
            pending_approvals: Vec::new(),
            last_message: None,
            input_locked: false,
            error_message: None,
        }
    }
}

impl UiState {
    pub fn awaiting_approval(&self) -> bool {
        self.status == AgentStatus::AwaitingApproval
    }
}
