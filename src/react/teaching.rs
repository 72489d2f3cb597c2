//! 教学模式：按讲解深度给 system prompt 追加说明，并拼装「为什么」「概念讲解」「代码评审」请求

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 讲解深度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeachingMode {
    /// 简洁回答（默认）
    #[default]
    #[serde(alias = "none")]
    Off,
    #[serde(alias = "brief")]
    Basic,
    #[serde(alias = "full")]
    Detailed,
    #[serde(alias = "advanced")]
    Expert,
}

impl TeachingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeachingMode::Off => "off",
            TeachingMode::Basic => "basic",
            TeachingMode::Detailed => "detailed",
            TeachingMode::Expert => "expert",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TeachingMode::Off => "Concise responses, minimal explanations",
            TeachingMode::Basic => "Brief explanations of key concepts",
            TeachingMode::Detailed => "Comprehensive explanations with examples",
            TeachingMode::Expert => "Deep technical explanations for advanced users",
        }
    }
}

impl fmt::Display for TeachingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TeachingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Ok(TeachingMode::Off),
            "basic" | "brief" | "1" => Ok(TeachingMode::Basic),
            "detailed" | "full" | "2" => Ok(TeachingMode::Detailed),
            "expert" | "advanced" | "3" => Ok(TeachingMode::Expert),
            other => Err(format!("unknown teaching mode: {}", other)),
        }
    }
}

/// 教学模式下回答要覆盖的内容
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeachingConfig {
    pub mode: TeachingMode,
    pub explain_reasoning: bool,
    pub show_alternatives: bool,
    pub provide_examples: bool,
    pub link_docs: bool,
}

impl TeachingConfig {
    /// 深度越高，开启的项越多
    pub fn for_mode(mode: TeachingMode) -> Self {
        let level = match mode {
            TeachingMode::Off => return Self::default(),
            TeachingMode::Basic => 1,
            TeachingMode::Detailed => 2,
            TeachingMode::Expert => 3,
        };
        Self {
            mode,
            explain_reasoning: true,
            show_alternatives: level >= 2,
            provide_examples: level >= 2,
            link_docs: level >= 3,
        }
    }

    /// 追加到 system prompt 的段落；Off 时为空
    pub fn prompt_addition(&self) -> String {
        let intro = match self.mode {
            TeachingMode::Off => return String::new(),
            TeachingMode::Basic => {
                "You are in teaching mode. Please provide brief explanations of your actions and key concepts."
            }
            TeachingMode::Detailed => {
                "You are in detailed teaching mode. Please provide comprehensive explanations with examples."
            }
            TeachingMode::Expert => {
                "You are in expert teaching mode. Please provide deep technical explanations suitable for advanced developers."
            }
        };

        let mut lines = vec!["## Teaching Mode Active".to_string(), String::new(), intro.to_string()];
        lines.push("\nWhen responding:".to_string());
        if self.explain_reasoning {
            lines.push("- Explain your reasoning and decision-making process".to_string());
            lines.push("- Describe why you chose a particular approach".to_string());
        }
        if self.show_alternatives {
            lines.push("- Mention alternative approaches when relevant".to_string());
            lines.push("- Discuss trade-offs between different solutions".to_string());
        }
        if self.provide_examples {
            lines.push("- Provide concrete code examples to illustrate concepts".to_string());
            lines.push("- Show before/after comparisons when making changes".to_string());
        }
        if self.link_docs {
            lines.push("- Reference relevant documentation or resources".to_string());
            lines.push("- Suggest further reading for deeper understanding".to_string());
        }
        lines.join("\n")
    }
}

/// 通用讲解请求
#[derive(Debug, Clone, Default)]
pub struct ExplanationRequest {
    pub topic: String,
    pub question: String,
    pub context: String,
    pub code_snippet: String,
    pub depth: TeachingMode,
}

impl ExplanationRequest {
    pub fn prompt(&self) -> String {
        let mut out = String::from("Please explain the following:\n");
        if !self.topic.is_empty() {
            out.push_str(&format!("Topic: {}\n", self.topic));
        }
        if !self.question.is_empty() {
            out.push_str(&format!("Question: {}\n", self.question));
        }
        if !self.context.is_empty() {
            out.push_str(&format!("Context: {}\n", self.context));
        }
        if !self.code_snippet.is_empty() {
            out.push_str(&format!("\nRelevant code:\n```\n{}\n```\n", self.code_snippet));
        }
        match self.depth {
            TeachingMode::Off => {}
            TeachingMode::Basic => out.push_str("\nPlease provide a brief, beginner-friendly explanation."),
            TeachingMode::Detailed => out.push_str("\nPlease provide a detailed explanation with examples."),
            TeachingMode::Expert => out.push_str(
                "\nPlease provide an in-depth technical explanation suitable for experienced developers.",
            ),
        }
        out
    }
}

pub fn why_question(change: &str, context: &str) -> String {
    format!(
        "I'd like to understand the reasoning behind this change:\n\n\
         Change: {}\n\n\
         Context: {}\n\n\
         Please explain:\n\
         - Why was this change made?\n\
         - What problem does it solve?\n\
         - Were there alternative approaches considered?\n\
         - What are the implications of this change?",
        change, context
    )
}

pub fn concept_explanation(concept: &str, related_code: &str) -> String {
    let mut prompt = format!("Please explain the concept of '{}'", concept);
    if !related_code.is_empty() {
        prompt.push_str(&format!(" in the context of this code:\n\n```\n{}\n```", related_code));
    }
    prompt.push_str(
        "\n\nInclude:\n\
         - A clear definition\n\
         - Why it's important\n\
         - Common use cases\n\
         - Best practices",
    );
    prompt
}

pub fn code_review_prompt(code: &str, concerns: &[String]) -> String {
    let mut prompt = format!("Please review and explain the following code:\n\n```\n{}\n```\n\n", code);
    if !concerns.is_empty() {
        prompt.push_str("Specific concerns:\n");
        for concern in concerns {
            prompt.push_str(&format!("- {}\n", concern));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Please provide:\n\
         - An overview of what this code does\n\
         - Analysis of potential issues\n\
         - Suggestions for improvement\n\
         - Best practices that apply here",
    );
    prompt
}
