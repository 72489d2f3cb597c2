//! Anvil - Rust 编码智能体
//!
//! 入口：初始化日志、加载配置并启动命令循环，然后运行按行读取 stdin 的交互界面。

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use anvil::core::{create_agent, format_approval_request, AgentStatus, Command, UiState};
use anvil::react::{AgentEvent, TeachingMode};

const HELP: &str = "\
Commands:
  /approve <id>          approve and run a pending tool call
  /reject <id> [reason]  reject a pending tool call
  /approve-all           approve every pending call
  /reject-all [reason]   reject every pending call
  /continue              resume after approvals
  /rollback              undo the last applied change set
  /reset                 clear conversation and plan
  /stats                 show token usage and estimated cost
  /teach <mode>          set teaching mode (off, basic, detailed, expert)
  /quit                  exit
Anything else is sent as a request. Ctrl+C cancels the running request.";

/// 解析一行输入；空行与 /help 返回 None
fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Submit(line.to_string()));
    }

    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let reason = |r: &str| {
        if r.is_empty() {
            "Rejected by user".to_string()
        } else {
            r.to_string()
        }
    };
    match head {
        "/approve" if !rest.is_empty() => Some(Command::Approve(rest.to_string())),
        "/reject" if !rest.is_empty() => {
            let (id, why) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            Some(Command::Reject {
                id: id.to_string(),
                reason: reason(why.trim()),
            })
        }
        "/approve-all" => Some(Command::ApproveAll),
        "/reject-all" => Some(Command::RejectAll(reason(rest))),
        "/continue" => Some(Command::Continue),
        "/rollback" => Some(Command::Rollback),
        "/reset" => Some(Command::Reset),
        "/stats" => Some(Command::Stats),
        "/teach" => match rest.parse::<TeachingMode>() {
            Ok(mode) => Some(Command::Teach(mode)),
            Err(e) => {
                eprintln!("{}", e);
                None
            }
        },
        "/quit" | "/exit" => Some(Command::Quit),
        _ => None,
    }
}

fn render_event(ev: &AgentEvent) {
    match ev {
        AgentEvent::PhaseChanged { phase } => eprintln!("· phase: {}", phase),
        AgentEvent::PlanCreated { steps } => {
            eprintln!("· plan:");
            for (i, s) in steps.iter().enumerate() {
                eprintln!("    {}. {}", i + 1, s);
            }
        }
        AgentEvent::StepStarted { id, description } => eprintln!("· step {}: {}", id + 1, description),
        AgentEvent::StepFailed { id, error } => eprintln!("· step {} failed: {}", id + 1, error),
        AgentEvent::ToolCall { tool, args, .. } => eprintln!("· tool {} {}", tool, args),
        AgentEvent::Observation { tool, preview } => eprintln!("· {} -> {}", tool, preview),
        AgentEvent::ToolFailure { tool, reason } => eprintln!("· {} failed: {}", tool, reason),
        AgentEvent::ContextPruned { summary, .. } => eprintln!("· {}", summary),
        AgentEvent::MessageChunk { text } => eprint!("{}", text),
        AgentEvent::MessageDone => eprintln!(),
        _ => {}
    }
}

fn render_state(state: &UiState) {
    if let Some(msg) = &state.last_message {
        println!("{}", msg);
    }
    if let Some(err) = &state.error_message {
        println!("error: {}", err);
    }
    if state.status == AgentStatus::AwaitingApproval {
        for item in &state.pending_approvals {
            println!("[{}]\n{}", item.id, format_approval_request(item));
        }
        println!("Use /approve <id> or /reject <id>, then /continue.");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    anvil::observability::init();

    let (cmd_tx, mut state_rx, mut event_rx) =
        create_agent(None).await.context("Failed to create agent")?;

    tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            render_event(&ev);
        }
    });

    let cancel_tx = cmd_tx.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(Command::Cancel);
        }
    });

    println!("anvil ready. /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let Some(cmd) = parse_command(&line) else {
            if line.trim() == "/help" {
                println!("{}", HELP);
            } else if line.trim().starts_with('/') {
                println!("Unknown command. /help for commands.");
            }
            continue;
        };
        let quit = cmd == Command::Quit;

        state_rx.borrow_and_update();
        cmd_tx.send(cmd).context("agent loop stopped")?;
        if quit {
            break;
        }

        loop {
            state_rx.changed().await.context("agent loop stopped")?;
            if state_rx.borrow().status != AgentStatus::Thinking {
                break;
            }
        }
        let state = state_rx.borrow_and_update().clone();
        render_state(&state);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  fix it "), Some(Command::Submit("fix it".into())));
        assert_eq!(parse_command("/approve approval_0"), Some(Command::Approve("approval_0".into())));
        assert_eq!(
            parse_command("/reject approval_1 too risky"),
            Some(Command::Reject {
                id: "approval_1".into(),
                reason: "too risky".into()
            })
        );
        assert_eq!(
            parse_command("/reject-all"),
            Some(Command::RejectAll("Rejected by user".into()))
        );
        assert_eq!(parse_command("/approve"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("/stats"), Some(Command::Stats));
        assert_eq!(
            parse_command("/teach detailed"),
            Some(Command::Teach(TeachingMode::Detailed))
        );
        assert_eq!(parse_command("/teach loudly"), None);
    }
}
