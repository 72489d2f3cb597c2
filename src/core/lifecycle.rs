//! 阶段状态机：Understand → Plan → Act → Verify（循环）+ 计划步骤
//!
//! 纯状态，无 I/O；只由 Agent 在单一控制任务上通过 `&mut` 修改。

use std::fmt;

use serde::Serialize;

/// 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Understand,
    Plan,
    Act,
    Verify,
}

impl Phase {
    /// 固定顺序的下一阶段，Verify 之后回到 Understand
    pub fn next(self) -> Phase {
        match self {
            Phase::Understand => Phase::Plan,
            Phase::Plan => Phase::Act,
            Phase::Act => Phase::Verify,
            Phase::Verify => Phase::Understand,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Understand => "Understand",
            Phase::Plan => "Plan",
            Phase::Act => "Act",
            Phase::Verify => "Verify",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Pending => "Pending",
            StepStatus::InProgress => "In Progress",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
        })
    }
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub id: usize,
    pub description: String,
    pub status: StepStatus,
    pub result: String,
    pub error: Option<String>,
}

/// 阶段 + 计划 + 当前步骤指针
#[derive(Debug, Clone)]
pub struct Lifecycle {
    phase: Phase,
    steps: Vec<PlanStep>,
    current: Option<usize>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Understand,
            steps: Vec::new(),
            current: None,
        }
    }

    pub fn current_phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn next_phase(&mut self) -> Phase {
        self.phase = self.phase.next();
        self.phase
    }

    /// 替换整个计划：所有步骤 Pending，当前指针失效
    pub fn set_plan<I, S>(&mut self, descriptions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps = descriptions
            .into_iter()
            .enumerate()
            .map(|(id, d)| PlanStep {
                id,
                description: d.into(),
                status: StepStatus::Pending,
                result: String::new(),
                error: None,
            })
            .collect();
        self.current = None;
    }

    /// 计划快照
    pub fn plan(&self) -> Vec<PlanStep> {
        self.steps.clone()
    }

    /// 找到第一个 Pending 步骤并置为 InProgress；没有则返回 None
    pub fn start_next_step(&mut self) -> Option<PlanStep> {
        // 至多一个 InProgress
        if self.current_step().is_some() {
            return None;
        }
        let idx = self
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)?;
        self.steps[idx].status = StepStatus::InProgress;
        self.current = Some(idx);
        Some(self.steps[idx].clone())
    }

    /// 当前 InProgress 的步骤（指针只在其仍为 InProgress 时有效）
    pub fn current_step(&self) -> Option<PlanStep> {
        self.current
            .and_then(|i| self.steps.get(i))
            .filter(|s| s.status == StepStatus::InProgress)
            .cloned()
    }

    fn current_mut(&mut self) -> Option<&mut PlanStep> {
        self.current
            .and_then(|i| self.steps.get_mut(i))
            .filter(|s| s.status == StepStatus::InProgress)
    }

    /// 无进行中步骤时为 no-op
    pub fn complete_current_step(&mut self, result: impl Into<String>) {
        if let Some(step) = self.current_mut() {
            step.status = StepStatus::Completed;
            step.result = result.into();
        }
        self.current = None;
    }

    /// 无进行中步骤时为 no-op
    pub fn fail_current_step(&mut self, error: impl Into<String>) {
        if let Some(step) = self.current_mut() {
            step.status = StepStatus::Failed;
            step.error = Some(error.into());
        }
        self.current = None;
    }

    /// 计划非空且全部 Completed
    pub fn all_steps_completed(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    pub fn has_failed_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    pub fn has_pending_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Pending)
    }

    /// 已完成百分比（0-100）
    pub fn progress(&self) -> u8 {
        if self.steps.is_empty() {
            return 0;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        (done * 100 / self.steps.len()) as u8
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
