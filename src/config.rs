//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANVIL__*` 覆盖（双下划线表示嵌套，如 `ANVIL__LLM__PROVIDER=mock`）。
//! 配置只在启动时读取一次，之后以普通结构体传入各构造函数。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::RetryConfig;
use crate::memory::{ContextConfig, DEFAULT_CHARS_PER_TOKEN};
use crate::react::TeachingMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentConfig,
    pub context: ContextSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录、会话目录
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 会话 JSON 目录，未设置时用 ./sessions
    pub session_dir: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }

    pub fn session_dir(&self) -> PathBuf {
        self.session_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("sessions"))
    }
}

/// [agent] 段：system prompt、子循环上限、采样参数
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// 子循环最大迭代数
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 直接回答（无计划/动作）后是否仍跑一次 Verify
    #[serde(default = "default_true")]
    pub verify_direct_answers: bool,
    /// 是否流式接收模型回复
    #[serde(default)]
    pub stream: bool,
    /// 教学模式：off | basic | detailed | expert
    #[serde(default)]
    pub teaching_mode: TeachingMode,
}

fn default_system_prompt() -> String {
    "You are anvil, a careful coding assistant. Understand the request, propose a numbered plan \
     when the work has several steps, use tools to inspect and change files, and verify the result."
        .to_string()
}

fn default_max_iterations() -> usize {
    10
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            verify_direct_answers: true,
            stream: false,
            teaching_mode: TeachingMode::Off,
        }
    }
}

/// [context] 段：上下文上限（0 表示不限）
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

fn default_max_messages() -> usize {
    100
}

fn default_context_max_tokens() -> usize {
    100_000
}

fn default_chars_per_token() -> usize {
    DEFAULT_CHARS_PER_TOKEN
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_tokens: default_context_max_tokens(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

impl From<&ContextSection> for ContextConfig {
    fn from(s: &ContextSection) -> Self {
        ContextConfig {
            max_messages: s.max_messages,
            max_tokens: s.max_tokens,
            chars_per_token: s.chars_per_token,
        }
        .normalized()
    }
}

/// [llm] 段：后端选择与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock；openai 在没有 API Key 时退回 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            retry: RetryConfig::default(),
        }
    }
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ANVIL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANVIL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANVIL")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 10);
        assert!(cfg.agent.verify_direct_answers);
        assert_eq!(cfg.agent.teaching_mode, TeachingMode::Off);
        assert_eq!(cfg.context.max_messages, 100);
        assert_eq!(cfg.llm.retry.max_retries, 3);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.app.workspace_root(), PathBuf::from("workspace"));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[agent]\nmax_iterations = 4\nteaching_mode = \"brief\"\n\n[context]\nmax_messages = 3\nchars_per_token = 0\n\n[llm]\nprovider = \"mock\"\n\n[llm.retry]\nmax_retries = 1\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 4);
        assert_eq!(cfg.agent.max_tokens, 4096);
        assert_eq!(cfg.agent.teaching_mode, TeachingMode::Basic);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.llm.retry.max_retries, 1);
        assert_eq!(cfg.llm.retry.initial_backoff_ms, 1000);

        let ctx = ContextConfig::from(&cfg.context);
        assert_eq!(ctx.max_messages, 3);
        assert_eq!(ctx.chars_per_token, DEFAULT_CHARS_PER_TOKEN);
    }
}
