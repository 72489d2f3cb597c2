//! Token 用量统计与费用估算
//!
//! 计数用原子变量累加，任何任务都可以只读取快照；费用按每百万 token 的公开单价粗略估算，
//! 未知模型不给出估算。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::llm::Usage;

/// 每百万 token 的 (输入, 输出) 单价，美元
fn price_per_million(model: &str) -> Option<(f64, f64)> {
    let model = model.to_lowercase();
    let price = match model.as_str() {
        "gpt-4o-mini" => (0.15, 0.60),
        "gpt-4o" => (2.50, 10.00),
        "gpt-4-turbo" | "gpt-4" => (10.00, 30.00),
        "gpt-3.5-turbo" => (0.50, 1.50),
        "claude-sonnet-4-5" | "claude-sonnet-4" | "claude-sonnet-3-5" => (3.00, 15.00),
        "claude-opus-4-5" | "claude-opus-4" => (15.00, 75.00),
        "claude-haiku-4" | "claude-haiku-3-5" => (0.25, 1.25),
        _ => return None,
    };
    Some(price)
}

/// 1234 -> "1.2K"，2_500_000 -> "2.5M"
pub fn format_token_count(tokens: u64) -> String {
    if tokens < 1_000 {
        tokens.to_string()
    } else if tokens < 1_000_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    }
}

/// 某一时刻的累计用量快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokenStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
    pub session_duration: Duration,
}

impl TokenStats {
    /// 估算费用（美元）；模型不在价格表中时返回 None
    pub fn estimated_cost(&self, model: &str) -> Option<f64> {
        let (input, output) = price_per_million(model)?;
        Some(
            self.prompt_tokens as f64 / 1_000_000.0 * input
                + self.completion_tokens as f64 / 1_000_000.0 * output,
        )
    }

    /// 状态行："1.2K tokens (in 800 / out 434), 3 requests"，可估算时追加费用
    pub fn format_stats(&self, model: &str) -> String {
        let mut line = self.to_string();
        if let Some(cost) = self.estimated_cost(model) {
            line.push_str(&format!(", ~${:.4}", cost));
        }
        line
    }
}

impl fmt::Display for TokenStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tokens (in {} / out {}), {} request{}",
            format_token_count(self.total_tokens),
            self.prompt_tokens,
            self.completion_tokens,
            self.request_count,
            if self.request_count == 1 { "" } else { "s" }
        )
    }
}

/// 累计计数器（Planner 每次请求模型后记录一次）
#[derive(Debug)]
pub struct TokenTracker {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    request_count: AtomicU64,
    started: Mutex<Instant>,
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self {
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }
    }
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次请求；流式回复没有用量时传 Usage::default()
    pub fn add(&self, usage: &Usage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TokenStats {
        let started = *self.started.lock().unwrap_or_else(PoisonError::into_inner);
        TokenStats {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
            request_count: self.request_count.load(Ordering::Relaxed),
            session_duration: started.elapsed(),
        }
    }

    pub fn reset(&self) {
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
        self.total_tokens.store(0, Ordering::Relaxed);
        self.request_count.store(0, Ordering::Relaxed);
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}
