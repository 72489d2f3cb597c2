//! Agent 编排器：Understand → Plan → Act → Verify
//!
//! 一次 process_request 把用户消息写入上下文，从 Understand 开始驱动生命周期，
//! 每个阶段跑一次子循环（react::run_turn）。遇到需审批的工具调用时挂起并返回待审批项；
//! approve_tool_call / reject_tool_call 处理决定，continue_after_approval 从当前阶段继续。
//! 教学模式下 ask_why / explain_concept / review_code 把讲解请求当作普通用户请求处理。
//! 同一实例同一时刻只允许一个请求（方法取 `&mut self`）。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::changes::{ChangeManager, ChangeSet};
use crate::config::AgentConfig;
use crate::core::{
    AgentError, ApprovalItem, ApprovalManager, ChangeError, Lifecycle, Phase, PlanStep, SessionSupervisor,
};
use crate::llm::{LlmClient, TokenStats};
use crate::memory::{ContextConfig, ContextManager, Message, PruneEvent};
use crate::react::events::send_event;
use crate::react::teaching::{code_review_prompt, concept_explanation, why_question};
use crate::react::{
    detect_action, detect_plan, extract_plan_steps, run_turn, AgentEvent, ExplanationRequest, Planner,
    ReactSession, TeachingConfig, TeachingMode, TurnOutcome,
};
use crate::tools::{ToolExecutor, ToolResult};

const VERIFY_PROMPT: &str = "Please verify the changes made and confirm everything is working correctly.";

/// 一次 process_request / continue_after_approval 的结果（不持久化）
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    /// 最后一次模型回复
    pub message: String,
    pub tool_calls: Vec<crate::tools::ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub requires_approval: bool,
    pub pending_approvals: Vec<ApprovalItem>,
    pub done: bool,
    pub phase: Phase,
    pub plan_steps: Vec<PlanStep>,
}

impl AgentResponse {
    fn new(phase: Phase) -> Self {
        Self {
            message: String::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            requires_approval: false,
            pending_approvals: Vec::new(),
            done: false,
            phase,
            plan_steps: Vec::new(),
        }
    }

    fn absorb(&mut self, turn: &TurnOutcome) {
        self.message = turn.message.clone();
        self.tool_calls.extend(turn.tool_calls.iter().cloned());
        self.tool_results.extend(turn.tool_results.iter().cloned());
    }
}

/// 编排器：组合上下文、生命周期、审批、变更管理与模型/工具
pub struct Agent {
    planner: Planner,
    executor: Arc<ToolExecutor>,
    context: Arc<ContextManager>,
    lifecycle: Lifecycle,
    approvals: Arc<ApprovalManager>,
    changes: Option<Arc<ChangeManager>>,
    supervisor: SessionSupervisor,
    config: AgentConfig,
    event_tx: Option<UnboundedSender<AgentEvent>>,
    prune_rx: UnboundedReceiver<PruneEvent>,
    /// 下一次 run_lifecycle 是审批后的恢复
    resuming: bool,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: ToolExecutor,
        config: AgentConfig,
        context_config: ContextConfig,
    ) -> Self {
        let planner = Planner::new(llm, config.system_prompt.clone())
            .with_sampling(config.temperature, config.max_tokens)
            .with_teaching(TeachingConfig::for_mode(config.teaching_mode));
        let context = Arc::new(ContextManager::with_config(context_config));
        let (prune_tx, prune_rx) = mpsc::unbounded_channel();
        context.set_prune_listener(prune_tx);

        Self {
            planner,
            executor: Arc::new(executor),
            context,
            lifecycle: Lifecycle::new(),
            approvals: Arc::new(ApprovalManager::new()),
            changes: None,
            supervisor: SessionSupervisor::new(),
            config,
            event_tx: None,
            prune_rx,
            resuming: false,
        }
    }

    /// 工具通过同一个 ChangeManager 改文件时，交给 Agent 以支持 rollback
    pub fn with_change_manager(mut self, changes: Arc<ChangeManager>) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn set_event_sender(&mut self, tx: UnboundedSender<AgentEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn context(&self) -> Arc<ContextManager> {
        Arc::clone(&self.context)
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn approvals(&self) -> Arc<ApprovalManager> {
        Arc::clone(&self.approvals)
    }

    pub fn changes(&self) -> Option<&Arc<ChangeManager>> {
        self.changes.as_ref()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        self.planner.model()
    }

    pub fn token_stats(&self) -> TokenStats {
        self.planner.token_stats()
    }

    /// 按深度切换教学模式，下一次模型调用生效
    pub fn set_teaching_mode(&mut self, mode: TeachingMode) {
        self.set_teaching_config(TeachingConfig::for_mode(mode));
    }

    pub fn teaching_mode(&self) -> TeachingMode {
        self.planner.teaching().mode
    }

    pub fn set_teaching_config(&mut self, teaching: TeachingConfig) {
        tracing::info!(mode = %teaching.mode, "teaching mode");
        self.config.teaching_mode = teaching.mode;
        self.planner.set_teaching(teaching);
    }

    pub fn teaching_config(&self) -> &TeachingConfig {
        self.planner.teaching()
    }

    /// 当前请求的取消令牌；上一个令牌已取消时先换新
    pub fn cancel_token(&mut self) -> CancellationToken {
        self.supervisor.renew();
        self.supervisor.cancel_token()
    }

    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    fn emit(&self, ev: AgentEvent) {
        send_event(self.event_tx.as_ref(), ev);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.lifecycle.current_phase() != phase {
            tracing::info!(from = %self.lifecycle.current_phase(), to = %phase, "phase");
        }
        self.lifecycle.set_phase(phase);
        self.emit(AgentEvent::PhaseChanged { phase });
    }

    /// 把上下文剪枝通知转成事件（在控制任务上消费）
    fn forward_pruned(&mut self) {
        while let Ok(ev) = self.prune_rx.try_recv() {
            tracing::debug!(pruned = ev.pruned.len(), "{}", ev.summary);
            send_event(
                self.event_tx.as_ref(),
                AgentEvent::ContextPruned {
                    pruned: ev.pruned.len(),
                    summary: ev.summary,
                },
            );
        }
    }

    /// 处理一条用户请求
    pub async fn process_request(&mut self, user_message: &str) -> Result<AgentResponse, AgentError> {
        self.supervisor.renew();
        self.resuming = false;
        self.set_phase(Phase::Understand);
        self.context.add_message(Message::user(user_message));
        tracing::info!(model = %self.planner.model(), "processing request");
        self.run_lifecycle().await
    }

    /// 审批处理完后从当前阶段继续
    pub async fn continue_after_approval(&mut self) -> Result<AgentResponse, AgentError> {
        if self.approvals.has_pending() {
            tracing::warn!(
                pending = self.approvals.pending_count(),
                "continuing with unresolved approvals"
            );
        }
        self.approvals.clear_resolved();
        self.supervisor.renew();
        self.resuming = true;
        self.run_lifecycle().await
    }

    async fn run_lifecycle(&mut self) -> Result<AgentResponse, AgentError> {
        let mut response = AgentResponse::new(self.lifecycle.current_phase());
        let mut resuming = std::mem::take(&mut self.resuming);

        loop {
            let phase = self.lifecycle.current_phase();
            response.phase = phase;

            match phase {
                Phase::Understand => {
                    let turn = self.run_phase_turn().await?;
                    response.absorb(&turn);
                    if turn.requires_approval() {
                        return Ok(self.suspend(response, turn));
                    }

                    if detect_plan(&turn.message) {
                        self.set_phase(Phase::Plan);
                    } else if detect_action(&turn.message) {
                        self.set_phase(Phase::Act);
                    } else {
                        response.done = true;
                        self.set_phase(Phase::Verify);
                        if !self.config.verify_direct_answers {
                            response.phase = Phase::Verify;
                            return Ok(response);
                        }
                    }
                }

                Phase::Plan => {
                    let steps = extract_plan_steps(&response.message);
                    if !steps.is_empty() {
                        tracing::info!(steps = steps.len(), "plan extracted");
                        self.emit(AgentEvent::PlanCreated { steps: steps.clone() });
                        self.lifecycle.set_plan(steps);
                        response.plan_steps = self.lifecycle.plan();
                    }
                    self.set_phase(Phase::Act);
                }

                Phase::Act => {
                    // 挂起在审批上的步骤继续执行，不重复注入指令
                    let step = match self.lifecycle.current_step() {
                        Some(step) => Some(step),
                        None => {
                            let next = self.lifecycle.start_next_step();
                            if let Some(step) = &next {
                                self.emit(AgentEvent::StepStarted {
                                    id: step.id,
                                    description: step.description.clone(),
                                });
                                self.context.add_message(Message::user(format!(
                                    "Execute step {}: {}",
                                    step.id + 1,
                                    step.description
                                )));
                            }
                            next
                        }
                    };

                    let turn = match self.run_phase_turn().await {
                        Ok(turn) => turn,
                        Err(e) => {
                            if let Some(step) = &step {
                                self.lifecycle.fail_current_step(e.to_string());
                                self.emit(AgentEvent::StepFailed {
                                    id: step.id,
                                    error: e.to_string(),
                                });
                            }
                            return Err(e);
                        }
                    };
                    response.absorb(&turn);
                    if turn.requires_approval() {
                        response.plan_steps = self.lifecycle.plan();
                        return Ok(self.suspend(response, turn));
                    }

                    if let Some(step) = &step {
                        self.lifecycle.complete_current_step(turn.message.clone());
                        self.emit(AgentEvent::StepCompleted { id: step.id });
                    }
                    response.plan_steps = self.lifecycle.plan();

                    if !self.lifecycle.has_pending_steps() {
                        self.set_phase(Phase::Verify);
                    }
                }

                Phase::Verify => {
                    if !resuming {
                        self.context.add_message(Message::user(VERIFY_PROMPT));
                    }
                    let turn = self.run_phase_turn().await?;
                    response.absorb(&turn);
                    if turn.requires_approval() {
                        return Ok(self.suspend(response, turn));
                    }
                    response.done = true;
                    response.plan_steps = self.lifecycle.plan();
                    return Ok(response);
                }
            }

            resuming = false;
        }
    }

    async fn run_phase_turn(&mut self) -> Result<TurnOutcome, AgentError> {
        let result = {
            let session = ReactSession::new(
                &self.planner,
                &self.executor,
                &self.context,
                self.supervisor.child_token(),
            )
            .with_event_tx(self.event_tx.as_ref())
            .with_max_iterations(self.config.max_iterations)
            .with_streaming(self.config.stream);
            run_turn(&session).await
        };
        self.forward_pruned();
        if let Err(e) = &result {
            tracing::error!(phase = %self.lifecycle.current_phase(), "request failed: {}", e);
            self.emit(AgentEvent::Error { text: e.to_string() });
        }
        result
    }

    /// 把待审批调用交给 ApprovalManager 并返回挂起的响应
    fn suspend(&self, mut response: AgentResponse, turn: TurnOutcome) -> AgentResponse {
        let items = self.approvals.add_pending(turn.pending);
        for item in &items {
            tracing::info!(id = %item.id, tool = %item.tool_call.name, "awaiting approval");
            self.emit(AgentEvent::ApprovalRequired {
                id: item.id.clone(),
                tool: item.tool_call.name.clone(),
                action: item.request.action.clone(),
                destructive: item.request.destructive,
            });
        }
        response.requires_approval = true;
        response.pending_approvals = items;
        response.done = false;
        response
    }

    /// 批准并执行（绕过执行器的审批闸门），结果写入上下文
    pub async fn approve_tool_call(&mut self, id: &str) -> Result<ToolResult, AgentError> {
        let item = self.approvals.approve(id)?;
        self.emit(AgentEvent::ApprovalResolved {
            id: item.id.clone(),
            approved: true,
        });
        let call = &item.tool_call;
        let token = self.supervisor.child_token();
        let result = self.executor.execute_approved(call, &token).await;
        match &result {
            Ok(r) => {
                self.context.add_message(Message::user(format!(
                    "Tool {} approved and executed:\n{}",
                    call.name, r.output
                )));
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, "approved tool failed: {}", e);
                self.context
                    .add_message(Message::user(format!("Tool {} failed: {}", call.name, e)));
                self.emit(AgentEvent::ToolFailure {
                    tool: call.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
        self.forward_pruned();
        result
    }

    /// 拒绝：只记录到上下文，不执行
    pub fn reject_tool_call(&mut self, id: &str, reason: &str) -> Result<(), AgentError> {
        let item = self.approvals.reject(id, reason)?;
        self.emit(AgentEvent::ApprovalResolved {
            id: item.id.clone(),
            approved: false,
        });
        self.context.add_message(Message::user(format!(
            "Tool {} rejected: {}",
            item.tool_call.name, reason
        )));
        self.forward_pruned();
        Ok(())
    }

    /// 按 FIFO 顺序批准全部待审批项；单项失败不影响其它项
    pub async fn approve_all(&mut self) -> Vec<(String, Result<ToolResult, AgentError>)> {
        let mut results = Vec::new();
        for item in self.approvals.pending() {
            let result = self.approve_tool_call(&item.id).await;
            results.push((item.id, result));
        }
        results
    }

    /// 拒绝全部待审批项，返回被拒绝的数量
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let mut rejected = 0;
        for item in self.approvals.pending() {
            if self.reject_tool_call(&item.id, reason).is_ok() {
                rejected += 1;
            }
        }
        rejected
    }

    /// 解释某处改动的原因
    pub async fn ask_why(&mut self, change: &str, context: &str) -> Result<AgentResponse, AgentError> {
        self.process_request(&why_question(change, context)).await
    }

    /// 讲解一个概念，可附相关代码
    pub async fn explain_concept(&mut self, concept: &str, related_code: &str) -> Result<AgentResponse, AgentError> {
        self.process_request(&concept_explanation(concept, related_code)).await
    }

    /// 评审并讲解一段代码
    pub async fn review_code(&mut self, code: &str, concerns: &[String]) -> Result<AgentResponse, AgentError> {
        self.process_request(&code_review_prompt(code, concerns)).await
    }

    pub async fn explain(&mut self, request: &ExplanationRequest) -> Result<AgentResponse, AgentError> {
        self.process_request(&request.prompt()).await
    }

    /// 回滚最近一次已应用的变更集
    pub fn rollback_last_change(&self) -> Result<ChangeSet, AgentError> {
        let changes = self.changes.as_ref().ok_or(ChangeError::NothingToRollback)?;
        let set = changes.rollback_change_set()?;
        tracing::info!(id = %set.id, "change set rolled back");
        Ok(set)
    }

    /// 清空上下文、生命周期、审批与用量统计；上下文上限与教学模式保留
    pub fn reset(&mut self) {
        self.context.reset();
        self.lifecycle.reset();
        self.approvals.clear();
        self.planner.reset_token_stats();
        self.resuming = false;
        while self.prune_rx.try_recv().is_ok() {}
        self.emit(AgentEvent::PhaseChanged {
            phase: Phase::Understand,
        });
    }
}
