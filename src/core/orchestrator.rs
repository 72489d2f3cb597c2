//! 命令循环：单一后台任务独占 Agent
//!
//! 负责：根据配置创建 LLM / 工具 / ChangeManager / Agent，建立 cmd / state / event 三通道，
//! 并在后台任务中按顺序消费命令（同一会话同一时刻只跑一个请求）。请求运行期间仍监听命令通道，
//! 以便 Cancel 立即生效；其它命令排队到请求结束后处理。

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentResponse};
use crate::changes::{ChangeManager, FsStorage};
use crate::config::{load_config, AppConfig};
use crate::core::{AgentError, AgentStatus, UiState};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, RetryingLlmClient};
use crate::memory::{ContextConfig, Session, SessionStore};
use crate::react::{AgentEvent, TeachingMode};
use crate::tools::{
    DeleteFileTool, EchoTool, ListDirTool, ReadFileTool, ToolExecutor, ToolRegistry, WriteFileTool,
};

/// 从 UI 发往命令循环的用户命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 提交用户输入，触发一次 process_request
    Submit(String),
    /// 批准并执行一个待审批调用
    Approve(String),
    Reject { id: String, reason: String },
    ApproveAll,
    RejectAll(String),
    /// 审批处理完后继续
    Continue,
    /// 回滚最近一次已应用的变更集
    Rollback,
    /// 清空对话与生命周期
    Reset,
    /// 发布本会话 token 用量与估算费用
    Stats,
    /// 切换教学模式
    Teach(TeachingMode),
    /// 取消当前请求
    Cancel,
    /// 退出
    Quit,
}

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock），外层包一层重试
pub(crate) fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg
        .llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    let inner: Arc<dyn LlmClient> = match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
            ))
        }
        ("mock", _) => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        _ => {
            tracing::warn!("No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    };
    Arc::new(RetryingLlmClient::new(inner, cfg.llm.retry.clone()))
}

/// 按配置组装 Agent：工作目录沙箱、文件工具共享同一个 ChangeManager
pub fn build_agent(cfg: &AppConfig) -> anyhow::Result<Agent> {
    let workspace = cfg.app.workspace_root();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    let changes = Arc::new(ChangeManager::new(Arc::new(FsStorage::new(&workspace))));

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(ReadFileTool::new(&workspace));
    tools.register(ListDirTool::new(&workspace));
    tools.register(WriteFileTool::new(&workspace, Arc::clone(&changes)));
    tools.register(DeleteFileTool::new(&workspace, Arc::clone(&changes)));
    tracing::info!(workspace = %workspace.display(), tools = tools.len(), "tools registered");

    let executor = ToolExecutor::new(tools, cfg.tools.tool_timeout_secs);
    let llm = create_llm_from_config(cfg);
    Ok(Agent::new(llm, executor, cfg.agent.clone(), ContextConfig::from(&cfg.context))
        .with_change_manager(changes))
}

/// 加载配置并启动命令循环：返回命令发送端、状态接收端、事件接收端
pub async fn create_agent(
    config_path: Option<PathBuf>,
) -> anyhow::Result<(
    mpsc::UnboundedSender<Command>,
    watch::Receiver<UiState>,
    mpsc::UnboundedReceiver<AgentEvent>,
)> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let mut agent = build_agent(&cfg)?;
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    agent.set_event_sender(event_tx);

    let store = SessionStore::new(cfg.app.session_dir());
    let (cmd_tx, state_rx) = spawn_agent(agent, Some(store));
    Ok((cmd_tx, state_rx, event_rx))
}

/// 当前 Agent 状态投影
fn snapshot(agent: &Agent, status: AgentStatus, last_message: Option<String>, error: Option<String>) -> UiState {
    let lifecycle = agent.lifecycle();
    UiState {
        status,
        phase: lifecycle.current_phase(),
        history: agent.context().messages(),
        plan: lifecycle.plan(),
        progress: lifecycle.progress(),
        pending_approvals: agent.approvals().pending(),
        last_message,
        input_locked: status == AgentStatus::Thinking,
        error_message: error,
    }
}

/// 运行一个请求；期间 Cancel 立即触发 token，其它命令排队
async fn run_cancellable<F>(
    fut: F,
    token: CancellationToken,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    deferred: &mut VecDeque<Command>,
) -> F::Output
where
    F: Future,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            Some(cmd) = cmd_rx.recv() => match cmd {
                Command::Cancel => {
                    tracing::info!("cancel requested");
                    token.cancel();
                }
                other => deferred.push_back(other),
            },
        }
    }
}

fn response_state(agent: &Agent, result: Result<AgentResponse, AgentError>) -> UiState {
    match result {
        Ok(resp) => {
            let status = if resp.requires_approval {
                AgentStatus::AwaitingApproval
            } else {
                AgentStatus::Idle
            };
            snapshot(agent, status, Some(resp.message), None)
        }
        Err(e) => snapshot(agent, AgentStatus::Error, None, Some(e.to_string())),
    }
}

fn idle_or_awaiting(agent: &Agent) -> AgentStatus {
    if agent.approvals().has_pending() {
        AgentStatus::AwaitingApproval
    } else {
        AgentStatus::Idle
    }
}

/// 会话快照落盘；失败只记日志
fn persist(store: Option<&SessionStore>, session: &mut Session, agent: &Agent) {
    let Some(store) = store else { return };
    session.capture(&agent.context());
    session.metadata.model = agent.model().to_string();
    session.metadata.total_tokens = agent.token_stats().total_tokens;
    if let Err(e) = store.save(session) {
        tracing::warn!("session save failed: {:#}", e);
    }
}

/// 启动后台任务独占 Agent；store 非空时每次请求结束后保存会话
pub fn spawn_agent(
    mut agent: Agent,
    store: Option<SessionStore>,
) -> (mpsc::UnboundedSender<Command>, watch::Receiver<UiState>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(UiState::default());

    tokio::spawn(async move {
        let mut deferred: VecDeque<Command> = VecDeque::new();
        let mut session = Session::new("");
        session.metadata.working_dir = std::env::current_dir()
            .map(|d| d.display().to_string())
            .unwrap_or_default();

        loop {
            let cmd = match deferred.pop_front() {
                Some(cmd) => cmd,
                None => match cmd_rx.recv().await {
                    Some(cmd) => cmd,
                    // cmd_tx 已关闭，退出循环
                    None => break,
                },
            };

            let state = match cmd {
                Command::Submit(input) => {
                    if session.name.is_empty() {
                        session.name = input.chars().take(60).collect();
                    }
                    let _ = state_tx.send(snapshot(&agent, AgentStatus::Thinking, None, None));
                    let token = agent.cancel_token();
                    let result =
                        run_cancellable(agent.process_request(&input), token, &mut cmd_rx, &mut deferred).await;
                    let state = response_state(&agent, result);
                    persist(store.as_ref(), &mut session, &agent);
                    state
                }
                Command::Continue => {
                    let _ = state_tx.send(snapshot(&agent, AgentStatus::Thinking, None, None));
                    let token = agent.cancel_token();
                    let result =
                        run_cancellable(agent.continue_after_approval(), token, &mut cmd_rx, &mut deferred).await;
                    let state = response_state(&agent, result);
                    persist(store.as_ref(), &mut session, &agent);
                    state
                }
                Command::Approve(id) => {
                    let token = agent.cancel_token();
                    let result =
                        run_cancellable(agent.approve_tool_call(&id), token, &mut cmd_rx, &mut deferred).await;
                    match result {
                        Ok(r) => snapshot(&agent, idle_or_awaiting(&agent), Some(r.output), None),
                        Err(e) => snapshot(&agent, idle_or_awaiting(&agent), None, Some(e.to_string())),
                    }
                }
                Command::Reject { id, reason } => match agent.reject_tool_call(&id, &reason) {
                    Ok(()) => snapshot(&agent, idle_or_awaiting(&agent), None, None),
                    Err(e) => snapshot(&agent, idle_or_awaiting(&agent), None, Some(e.to_string())),
                },
                Command::ApproveAll => {
                    let token = agent.cancel_token();
                    let results = run_cancellable(agent.approve_all(), token, &mut cmd_rx, &mut deferred).await;
                    let errors: Vec<String> = results
                        .into_iter()
                        .filter_map(|(id, r)| r.err().map(|e| format!("{}: {}", id, e)))
                        .collect();
                    let error = (!errors.is_empty()).then(|| errors.join("; "));
                    snapshot(&agent, idle_or_awaiting(&agent), None, error)
                }
                Command::RejectAll(reason) => {
                    let n = agent.reject_all(&reason);
                    snapshot(&agent, idle_or_awaiting(&agent), Some(format!("Rejected {} call(s)", n)), None)
                }
                Command::Rollback => match agent.rollback_last_change() {
                    Ok(set) => snapshot(&agent, AgentStatus::Idle, Some(format!("Rolled back {}", set.summary())), None),
                    Err(e) => snapshot(&agent, AgentStatus::Error, None, Some(e.to_string())),
                },
                Command::Reset => {
                    agent.reset();
                    session = Session::new("");
                    snapshot(&agent, AgentStatus::Idle, None, None)
                }
                Command::Stats => {
                    let line = agent.token_stats().format_stats(agent.model());
                    snapshot(&agent, idle_or_awaiting(&agent), Some(line), None)
                }
                Command::Teach(mode) => {
                    agent.set_teaching_mode(mode);
                    let line = format!("Teaching mode: {} ({})", mode, mode.description());
                    snapshot(&agent, idle_or_awaiting(&agent), Some(line), None)
                }
                // 没有正在运行的请求时无事可做
                Command::Cancel => continue,
                Command::Quit => break,
            };
            let _ = state_tx.send(state);
        }
        tracing::info!("agent loop stopped");
    });

    (cmd_tx, state_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::llm::ScriptedLlmClient;

    fn agent(replies: &[&str]) -> Agent {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        Agent::new(
            Arc::new(ScriptedLlmClient::new(replies.iter().copied())),
            ToolExecutor::new(registry, 5),
            AgentConfig::default(),
            ContextConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_submit_publishes_idle_state() {
        let (tx, mut rx) = spawn_agent(agent(&["Hello there.", "Looks good."]), None);
        tx.send(Command::Submit("hi".into())).unwrap();

        let state = rx
            .wait_for(|s| s.status == AgentStatus::Idle && s.last_message.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(state.last_message.as_deref(), Some("Looks good."));
        assert_eq!(state.history.len(), 4);
        assert!(!state.input_locked);
        tx.send(Command::Quit).unwrap();
    }

    #[tokio::test]
    async fn test_model_error_is_published() {
        let (tx, mut rx) = spawn_agent(agent(&[]), None);
        tx.send(Command::Submit("hi".into())).unwrap();
        let state = rx
            .wait_for(|s| s.status == AgentStatus::Error)
            .await
            .unwrap()
            .clone();
        assert!(state.error_message.unwrap().contains("no scripted reply left"));
    }

    #[tokio::test]
    async fn test_session_saved_after_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let (tx, mut rx) = spawn_agent(agent(&["Sure.", "Done."]), Some(store.clone()));
        tx.send(Command::Submit("rename the module".into())).unwrap();
        rx.wait_for(|s| s.status == AgentStatus::Idle && s.last_message.is_some())
            .await
            .unwrap();

        let sessions = store.list().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "rename the module");
        assert_eq!(sessions[0].messages.len(), 4);
    }

    #[tokio::test]
    async fn test_stats_and_teach_commands() {
        let (tx, mut rx) = spawn_agent(agent(&["Hello there.", "Looks good."]), None);
        tx.send(Command::Submit("hi".into())).unwrap();
        rx.wait_for(|s| s.status == AgentStatus::Idle && s.last_message.is_some())
            .await
            .unwrap();

        tx.send(Command::Stats).unwrap();
        let state = rx
            .wait_for(|s| s.last_message.as_deref().is_some_and(|m| m.contains("request")))
            .await
            .unwrap()
            .clone();
        assert!(state.last_message.unwrap().ends_with("2 requests"));

        tx.send(Command::Teach(TeachingMode::Expert)).unwrap();
        let state = rx
            .wait_for(|s| s.last_message.as_deref().is_some_and(|m| m.starts_with("Teaching mode")))
            .await
            .unwrap()
            .clone();
        assert_eq!(
            state.last_message.as_deref(),
            Some("Teaching mode: expert (Deep technical explanations for advanced users)")
        );
        tx.send(Command::Quit).unwrap();
    }
}
