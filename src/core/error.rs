//! Agent 错误类型
//!
//! - `AgentError`：一次 process_request 的终止原因（模型错误、循环超限、取消等）
//! - `ApprovalError`：审批状态错误（不存在 / 已处理），必须返回给调用方，不能吞掉
//! - `ChangeError`：变更集应用与回滚错误

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::approval::ApprovalStatus;
use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("agent loop exceeded maximum iterations ({max_iterations})")]
    LoopExhausted { max_iterations: usize },

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Change(#[from] ChangeError),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),
}

impl AgentError {
    /// 是否终止当前请求；工具错误只记录进上下文，循环继续
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AgentError::ToolNotFound(_)
                | AgentError::ToolExecutionFailed(_)
                | AgentError::ToolTimeout(_)
                | AgentError::PathEscape(_)
        )
    }
}

/// 审批状态错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval item {0} not found")]
    NotFound(String),

    #[error("approval item {id} is not pending (already {status})")]
    AlreadyResolved { id: String, status: ApprovalStatus },
}

/// 单个文件回滚失败（路径 + 原因）
#[derive(Debug)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub error: io::Error,
}

/// 变更集错误
#[derive(Error, Debug)]
pub enum ChangeError {
    #[error("no active change set")]
    NoActiveChangeSet,

    #[error("no change sets to rollback")]
    NothingToRollback,

    #[error("change set {0} already rolled back")]
    AlreadyRolledBack(String),

    /// 应用第 k 个变更失败；[0, k) 已按逆序回滚，rollback_failures 记录回滚中失败的文件
    #[error("failed to apply change to {}: {source}", path.display())]
    Apply {
        path: PathBuf,
        #[source]
        source: io::Error,
        rollback_failures: Vec<RollbackFailure>,
    },

    #[error("rollback incomplete: {} file(s) could not be restored", failures.len())]
    RollbackIncomplete { failures: Vec<RollbackFailure> },
}
