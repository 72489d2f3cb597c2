//! 核心编排层：错误、生命周期、审批、状态投影、会话监管、命令循环

pub mod approval;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use approval::{format_approval_request, ApprovalCallback, ApprovalItem, ApprovalManager, ApprovalStatus};
pub use error::{AgentError, ApprovalError, ChangeError, RollbackFailure};
pub use lifecycle::{Lifecycle, Phase, PlanStep, StepStatus};
pub use orchestrator::{build_agent, create_agent, spawn_agent, Command};
pub use session_supervisor::SessionSupervisor;
pub use state::{AgentStatus, UiState};
