//! Planner：请求拼装与回复解析
//!
//! build_request 把 system prompt（基础 prompt + 教学模式说明 + 工具说明）作为首条 System 消息放在上下文之前；
//! 回复中的 `<tool_use>` 块解析为 ToolCall，计划/动作识别为关键词启发式（不保证准确）。
//! 每次模型调用的用量记入 TokenTracker。

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::core::AgentError;
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmStream, TokenStats, TokenTracker, Usage};
use crate::memory::Message;
use crate::react::teaching::TeachingConfig;
use crate::tools::{tool_call_schema_json, ToolCall, ToolDefinition, ToolUseDirective};

const TOOL_USE_OPEN: &str = "<tool_use>";

const PLAN_INDICATORS: &[&str] = &[
    "here's my plan",
    "i will:",
    "steps:",
    "plan:",
    "1.",
    "step 1:",
    "first,",
];

const ACTION_INDICATORS: &[&str] = &[
    TOOL_USE_OPEN,
    "let me",
    "i'll read",
    "i'll check",
    "reading",
    "checking",
];

static TOOL_USE_RE: OnceLock<Regex> = OnceLock::new();
static NUMBERED_STEP_RE: OnceLock<Regex> = OnceLock::new();

fn tool_use_re() -> &'static Regex {
    TOOL_USE_RE.get_or_init(|| Regex::new(r"(?s)<tool_use>(.*?)</tool_use>").expect("static regex"))
}

fn numbered_step_re() -> &'static Regex {
    NUMBERED_STEP_RE.get_or_init(|| Regex::new(r"^[1-9]\.(.+)$").expect("static regex"))
}

/// 回复是否像一份计划
pub fn detect_plan(content: &str) -> bool {
    let lower = content.to_lowercase();
    PLAN_INDICATORS.iter().any(|i| lower.contains(i))
}

/// 回复是否表示直接动手（含 `<tool_use>`）
pub fn detect_action(content: &str) -> bool {
    let lower = content.to_lowercase();
    ACTION_INDICATORS.iter().any(|i| lower.contains(i))
}

/// 提取 `1. xxx` 与 `Step N: xxx` 形式的计划行
pub fn extract_plan_steps(content: &str) -> Vec<String> {
    let mut steps = Vec::new();
    for line in content.lines().map(str::trim) {
        if let Some(caps) = numbered_step_re().captures(line) {
            let step = caps[1].trim();
            if !step.is_empty() {
                steps.push(step.to_string());
            }
        } else if line.to_lowercase().starts_with("step ") {
            if let Some((_, rest)) = line.split_once(':') {
                let step = rest.trim();
                if !step.is_empty() {
                    steps.push(step.to_string());
                }
            }
        }
    }
    steps
}

/// 按出现顺序解析 `<tool_use>` 块；JSON 不合法的块跳过，id 为 call_<k>
pub fn extract_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    for caps in tool_use_re().captures_iter(content) {
        match serde_json::from_str::<ToolUseDirective>(caps[1].trim()) {
            Ok(d) => {
                let id = format!("call_{}", calls.len());
                calls.push(ToolCall {
                    id,
                    name: d.name,
                    arguments: d.arguments,
                });
            }
            Err(e) => tracing::debug!("skipping malformed tool_use block: {}", e),
        }
    }
    calls
}

/// Planner：持有 LLM、基础 system prompt、教学模式与采样参数
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    teaching: TeachingConfig,
    temperature: f32,
    max_tokens: u32,
    tracker: TokenTracker,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            teaching: TeachingConfig::default(),
            temperature: 0.7,
            max_tokens: 4096,
            tracker: TokenTracker::new(),
        }
    }

    pub fn with_teaching(mut self, teaching: TeachingConfig) -> Self {
        self.teaching = teaching;
        self
    }

    pub fn set_teaching(&mut self, teaching: TeachingConfig) {
        self.teaching = teaching;
    }

    pub fn teaching(&self) -> &TeachingConfig {
        &self.teaching
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    /// 本会话累计用量（流式调用只计次数）
    pub fn token_stats(&self) -> TokenStats {
        self.tracker.stats()
    }

    pub fn reset_token_stats(&self) {
        self.tracker.reset();
    }

    /// 基础 prompt + 教学模式说明 + 工具定义 + `<tool_use>` 格式说明
    pub fn system_prompt(&self, tools: &[ToolDefinition]) -> String {
        let teaching = self.teaching.prompt_addition();
        if tools.is_empty() && teaching.is_empty() {
            return self.system_prompt.clone();
        }
        let mut prompt = self.system_prompt.trim_end().to_string();
        if !teaching.is_empty() {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(&teaching);
        }
        if tools.is_empty() {
            return prompt;
        }
        let definitions = serde_json::to_string_pretty(tools).unwrap_or_else(|_| "[]".to_string());
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str("## Tools\n\nAvailable tools:\n");
        prompt.push_str(&definitions);
        prompt.push_str(
            "\n\nTo call a tool, embed a block in your reply:\n\
             <tool_use>{\"name\": \"tool_name\", \"arguments\": {...}}</tool_use>\n\
             The block must match this JSON schema:\n",
        );
        prompt.push_str(&tool_call_schema_json());
        prompt
    }

    /// system prompt 作为首条 System 消息，其后是完整上下文
    pub fn build_request(&self, context: Vec<Message>, tools: Vec<ToolDefinition>) -> CompletionRequest {
        let system = self.system_prompt(&tools);
        let mut messages = Vec::with_capacity(context.len() + 1);
        if !system.is_empty() {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(context);
        CompletionRequest {
            messages,
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: (!system.is_empty()).then_some(system),
        }
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, AgentError> {
        let response = self.llm.complete(request).await?;
        self.tracker.add(&response.usage);
        Ok(response)
    }

    pub async fn stream(&self, request: &CompletionRequest) -> Result<LlmStream, AgentError> {
        let stream = self.llm.complete_stream(request).await?;
        self.tracker.add(&Usage::default());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;
    use crate::react::teaching::TeachingMode;

    #[test]
    fn test_extract_tool_calls_skips_bad_json() {
        let reply = r#"Let me look.
<tool_use>{"name": "read_file", "arguments": {"path": "a.rs"}}</tool_use>
<tool_use>{not json}</tool_use>
<tool_use>
{"name": "list_dir"}
</tool_use>"#;
        let calls = extract_tool_calls(reply);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].arguments_value(), json!({"path": "a.rs"}));
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].name, "list_dir");
        assert!(calls[1].arguments.is_empty());
    }

    #[test]
    fn test_unclosed_tool_use_is_ignored() {
        assert!(extract_tool_calls("<tool_use>{\"name\": \"echo\"}").is_empty());
    }

    #[test]
    fn test_extract_plan_steps() {
        let reply = "Here's my plan:\n1. Read the config\n  2.  Fix the parser \n3.\nStep 4: Run tests\nstep five\n10. ignored? no";
        let steps = extract_plan_steps(reply);
        assert_eq!(steps, vec!["Read the config", "Fix the parser", "Run tests"]);
    }

    #[test]
    fn test_detection_is_case_insensitive() {
        assert!(detect_plan("PLAN: do it"));
        assert!(detect_plan("First, open the file"));
        assert!(!detect_plan("The answer is 42"));
        assert!(detect_action("Let me check"));
        assert!(detect_action("<tool_use>{}</tool_use>"));
        assert!(!detect_action("Done."));
    }

    #[test]
    fn test_build_request_prepends_system() {
        let planner = Planner::new(Arc::new(MockLlmClient), "You are anvil.").with_sampling(0.1, 256);
        let tools = vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        }];
        let req = planner.build_request(vec![Message::user("hi")], tools);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert!(req.messages[0].content.starts_with("You are anvil."));
        assert!(req.messages[0].content.contains("\"echo\""));
        assert!(req.messages[0].content.contains("<tool_use>"));
        assert_eq!(req.max_tokens, 256);
        assert_eq!(req.tools.len(), 1);
    }

    #[test]
    fn test_empty_prompt_without_tools_sends_context_only() {
        let planner = Planner::new(Arc::new(MockLlmClient), "");
        let req = planner.build_request(vec![Message::user("hi")], Vec::new());
        assert_eq!(req.messages.len(), 1);
        assert!(req.system_prompt.is_none());
    }

    #[test]
    fn test_teaching_addition_in_system_message() {
        let planner = Planner::new(Arc::new(MockLlmClient), "You are anvil.")
            .with_teaching(TeachingConfig::for_mode(TeachingMode::Expert));
        let req = planner.build_request(vec![Message::user("hi")], Vec::new());
        let system = &req.messages[0].content;
        assert!(system.starts_with("You are anvil.\n\n## Teaching Mode Active"));
        assert!(system.contains("expert teaching mode"));
        assert!(!system.contains("## Tools"));

        let tools = vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        }];
        let with_tools = planner.system_prompt(&tools);
        let teaching_at = with_tools.find("## Teaching Mode Active").unwrap();
        assert!(teaching_at < with_tools.find("## Tools").unwrap());
    }

    #[tokio::test]
    async fn test_completions_are_counted() {
        let planner = Planner::new(Arc::new(MockLlmClient), "");
        let req = planner.build_request(vec![Message::user("hi")], Vec::new());
        planner.complete(&req).await.unwrap();
        planner.complete(&req).await.unwrap();
        assert_eq!(planner.token_stats().request_count, 2);
        planner.reset_token_stats();
        assert_eq!(planner.token_stats().request_count, 0);
    }
}
