//! 有界对话上下文（Context Manager）
//!
//! 持有有序对话历史，按「消息条数」与「估算 token」两个上限剪枝：
//! 先按条数丢弃最旧的非 system 消息，再从最新往旧保留不超过 token 预算的连续后缀。
//! System 消息（指令）永不剪除，且始终排在最前。
//!
//! token 数只是估算：`sum(len(content)) / chars_per_token`，按字节计，
//! 与任何真实 tokenizer 的结果都可能有偏差，不能当作精确值使用。
//!
//! 内部状态由 Mutex 保护，所有读接口返回副本，UI / 持久化线程可随时读取快照。

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::memory::{Message, Role};

/// chars_per_token 未设置（0）时的默认值
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// 上下文上限配置；max_messages / max_tokens 为 0 表示不限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub max_messages: usize,
    pub max_tokens: usize,
    pub chars_per_token: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_tokens: 100_000,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl ContextConfig {
    /// chars_per_token 必须为正
    pub fn normalized(mut self) -> Self {
        if self.chars_per_token == 0 {
            self.chars_per_token = DEFAULT_CHARS_PER_TOKEN;
        }
        self
    }
}

/// 一次剪枝事件：被丢弃消息的副本与简短摘要
#[derive(Debug, Clone)]
pub struct PruneEvent {
    pub pruned: Vec<Message>,
    pub summary: String,
}

/// 上下文统计（按角色计数 + token 估算）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub message_count: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub system_messages: usize,
    pub estimated_tokens: usize,
    pub pruned_count: usize,
    pub max_messages: usize,
    pub max_tokens: usize,
}

#[derive(Debug)]
struct Inner {
    messages: Vec<Message>,
    config: ContextConfig,
    pruned_summary: String,
    pruned_count: usize,
    listener: Option<mpsc::UnboundedSender<PruneEvent>>,
}

impl Inner {
    fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }

    fn estimate_tokens(&self) -> usize {
        self.total_chars() / self.config.chars_per_token
    }

    fn check_and_prune(&mut self) {
        let over_count =
            self.config.max_messages > 0 && self.messages.len() > self.config.max_messages;
        let over_tokens =
            self.config.max_tokens > 0 && self.estimate_tokens() > self.config.max_tokens;
        if over_count || over_tokens {
            self.prune();
        }
    }

    fn prune(&mut self) {
        let (system, mut other): (Vec<Message>, Vec<Message>) =
            self.messages.drain(..).partition(Message::is_system);
        let mut pruned = Vec::new();

        if self.config.max_messages > 0 {
            let max_other = self.config.max_messages.saturating_sub(system.len());
            if other.len() > max_other {
                let excess = other.len() - max_other;
                pruned.extend(other.drain(..excess));
            }
        }

        if self.config.max_tokens > 0 {
            // estimate <= max_tokens  <=>  total_chars <= (max_tokens + 1) * cpt - 1
            let char_budget = self
                .config
                .max_tokens
                .saturating_add(1)
                .saturating_mul(self.config.chars_per_token)
                .saturating_sub(1);
            let system_chars: usize = system.iter().map(|m| m.content.len()).sum();

            let mut keep_from = other.len();
            if system_chars <= char_budget {
                let available = char_budget - system_chars;
                let mut used = 0usize;
                for (i, msg) in other.iter().enumerate().rev() {
                    let len = msg.content.len();
                    if used + len > available {
                        break;
                    }
                    used += len;
                    keep_from = i;
                }
            }
            pruned.extend(other.drain(..keep_from));
        }

        self.messages = system;
        self.messages.extend(other);

        if pruned.is_empty() {
            return;
        }
        self.pruned_count += pruned.len();
        self.pruned_summary = pruned_summary(&pruned);
        tracing::debug!(
            pruned = pruned.len(),
            remaining = self.messages.len(),
            "context pruned"
        );
        if let Some(tx) = &self.listener {
            let _ = tx.send(PruneEvent {
                pruned,
                summary: self.pruned_summary.clone(),
            });
        }
    }
}

/// "Pruned N user message(s) and M assistant message(s) from context"
fn pruned_summary(pruned: &[Message]) -> String {
    let users = pruned.iter().filter(|m| m.role == Role::User).count();
    let assistants = pruned.iter().filter(|m| m.role == Role::Assistant).count();
    let mut parts = Vec::new();
    if users > 0 {
        parts.push(format!("{} user message(s)", users));
    }
    if assistants > 0 {
        parts.push(format!("{} assistant message(s)", assistants));
    }
    format!("Pruned {} from context", parts.join(" and "))
}

/// 上下文管理器：只由 Agent 写入，其它线程只读快照
#[derive(Debug)]
pub struct ContextManager {
    inner: Mutex<Inner>,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                config: config.normalized(),
                pruned_summary: String::new(),
                pruned_count: 0,
                listener: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册剪枝监听：事件经无界通道投递，不阻塞写入方
    pub fn set_prune_listener(&self, tx: mpsc::UnboundedSender<PruneEvent>) {
        self.lock().listener = Some(tx);
    }

    /// 追加消息，超限时立即剪枝
    pub fn add_message(&self, msg: Message) {
        let mut inner = self.lock();
        inner.messages.push(msg);
        inner.check_and_prune();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// 最近 n 条消息（副本）
    pub fn recent_messages(&self, n: usize) -> Vec<Message> {
        let inner = self.lock();
        let start = inner.messages.len().saturating_sub(n);
        inner.messages[start..].to_vec()
    }

    pub fn clear(&self) {
        self.lock().messages.clear();
    }

    /// 清空消息与剪枝统计，保留上限配置（新会话）
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.messages.clear();
        inner.pruned_count = 0;
        inner.pruned_summary.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn set_max_size(&self, max_messages: usize) {
        let mut inner = self.lock();
        inner.config.max_messages = max_messages;
        inner.check_and_prune();
    }

    pub fn set_max_tokens(&self, max_tokens: usize) {
        let mut inner = self.lock();
        inner.config.max_tokens = max_tokens;
        inner.check_and_prune();
    }

    pub fn config(&self) -> ContextConfig {
        self.lock().config
    }

    pub fn set_config(&self, config: ContextConfig) {
        let mut inner = self.lock();
        inner.config = config.normalized();
        inner.check_and_prune();
    }

    /// 估算 token 数（字节数 / chars_per_token，近似值）
    pub fn estimate_tokens(&self) -> usize {
        self.lock().estimate_tokens()
    }

    pub fn stats(&self) -> ContextStats {
        let inner = self.lock();
        let count = |role: Role| inner.messages.iter().filter(|m| m.role == role).count();
        ContextStats {
            message_count: inner.messages.len(),
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            system_messages: count(Role::System),
            estimated_tokens: inner.estimate_tokens(),
            pruned_count: inner.pruned_count,
            max_messages: inner.config.max_messages,
            max_tokens: inner.config.max_tokens,
        }
    }

    pub fn pruned_summary(&self) -> String {
        self.lock().pruned_summary.clone()
    }

    pub fn pruned_count(&self) -> usize {
        self.lock().pruned_count
    }

    /// 无条件移除最后一条消息（回滚失败的一轮）
    pub fn remove_last_message(&self) -> Option<Message> {
        self.lock().messages.pop()
    }

    /// 无条件移除最后 n 条消息
    pub fn remove_last_n(&self, n: usize) {
        let mut inner = self.lock();
        let keep = inner.messages.len().saturating_sub(n);
        inner.messages.truncate(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlimited_tokens(max_messages: usize) -> ContextConfig {
        ContextConfig {
            max_messages,
            max_tokens: 0,
            chars_per_token: 4,
        }
    }

    #[test]
    fn test_message_count_keeps_system_and_most_recent() {
        let ctx = ContextManager::with_config(unlimited_tokens(3));
        ctx.add_message(Message::system("A"));
        ctx.add_message(Message::user("B"));
        ctx.add_message(Message::user("C"));
        ctx.add_message(Message::user("D"));
        ctx.add_message(Message::user("E"));

        let contents: Vec<String> = ctx.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["A", "D", "E"]);
        assert_eq!(ctx.pruned_count(), 2);
        assert_eq!(
            ctx.pruned_summary(),
            "Pruned 2 user message(s) from context"
        );
    }

    #[test]
    fn test_system_messages_stay_first_in_order() {
        let ctx = ContextManager::with_config(unlimited_tokens(4));
        ctx.add_message(Message::user("u1"));
        ctx.add_message(Message::system("s1"));
        ctx.add_message(Message::assistant("a1"));
        ctx.add_message(Message::system("s2"));
        ctx.add_message(Message::user("u2"));

        let msgs = ctx.messages();
        assert_eq!(msgs[0], Message::system("s1"));
        assert_eq!(msgs[1], Message::system("s2"));
        assert_eq!(msgs[2], Message::assistant("a1"));
        assert_eq!(msgs[3], Message::user("u2"));
    }

    #[test]
    fn test_token_bound_holds_after_every_add() {
        let ctx = ContextManager::with_config(ContextConfig {
            max_messages: 0,
            max_tokens: 10,
            chars_per_token: 4,
        });
        ctx.add_message(Message::system("be brief"));
        let sizes = [3usize, 17, 1, 9, 30, 2, 2, 2, 2, 41, 5];
        for (i, n) in sizes.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            ctx.add_message(Message::new(role, "x".repeat(*n)));

            let msgs = ctx.messages();
            assert!(msgs.iter().any(|m| m.content == "be brief"));
            let non_system = msgs.iter().filter(|m| !m.is_system()).count();
            assert!(ctx.estimate_tokens() <= 10 || non_system == 0);
        }
    }

    #[test]
    fn test_oversized_system_prunes_all_other_messages() {
        let ctx = ContextManager::with_config(ContextConfig {
            max_messages: 0,
            max_tokens: 2,
            chars_per_token: 1,
        });
        ctx.add_message(Message::system("a long instruction block"));
        ctx.add_message(Message::user(""));
        ctx.add_message(Message::user("hi"));

        let msgs = ctx.messages();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].is_system());
    }

    #[test]
    fn test_token_pruning_keeps_contiguous_recent_suffix() {
        let ctx = ContextManager::with_config(ContextConfig {
            max_messages: 0,
            max_tokens: 0,
            chars_per_token: 1,
        });
        ctx.add_message(Message::user("aa"));
        ctx.add_message(Message::assistant("bbbbbbbb"));
        ctx.add_message(Message::user("cc"));
        ctx.add_message(Message::assistant("ddd"));
        ctx.set_max_tokens(6);

        let contents: Vec<String> = ctx.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["cc", "ddd"]);
        assert_eq!(
            ctx.pruned_summary(),
            "Pruned 1 user message(s) and 1 assistant message(s) from context"
        );
    }

    #[test]
    fn test_set_max_size_prunes_immediately() {
        let ctx = ContextManager::with_config(unlimited_tokens(0));
        for i in 0..6 {
            ctx.add_message(Message::user(format!("m{}", i)));
        }
        ctx.set_max_size(2);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.messages()[0].content, "m4");
    }

    #[test]
    fn test_chars_per_token_defaults_when_zero() {
        let ctx = ContextManager::with_config(ContextConfig {
            max_messages: 0,
            max_tokens: 0,
            chars_per_token: 0,
        });
        assert_eq!(ctx.config().chars_per_token, DEFAULT_CHARS_PER_TOKEN);
        ctx.add_message(Message::user("12345678"));
        assert_eq!(ctx.estimate_tokens(), 2);

        ctx.set_config(ContextConfig {
            max_messages: 0,
            max_tokens: 0,
            chars_per_token: 0,
        });
        assert_eq!(ctx.config().chars_per_token, DEFAULT_CHARS_PER_TOKEN);
    }

    #[test]
    fn test_returned_messages_are_copies() {
        let ctx = ContextManager::new();
        ctx.add_message(Message::user("original"));
        let mut snapshot = ctx.messages();
        snapshot[0].content = "tampered".into();
        snapshot.push(Message::user("extra"));
        assert_eq!(ctx.messages(), vec![Message::user("original")]);
    }

    #[test]
    fn test_recent_and_remove_last() {
        let ctx = ContextManager::new();
        for i in 0..5 {
            ctx.add_message(Message::user(format!("m{}", i)));
        }
        let recent = ctx.recent_messages(2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(ctx.recent_messages(10).len(), 5);

        assert_eq!(ctx.remove_last_message().unwrap().content, "m4");
        ctx.remove_last_n(2);
        assert_eq!(ctx.len(), 2);
        ctx.remove_last_n(10);
        assert!(ctx.is_empty());
        assert!(ctx.remove_last_message().is_none());
    }

    #[test]
    fn test_stats_partition_by_role() {
        let ctx = ContextManager::new();
        ctx.add_message(Message::system("ssss"));
        ctx.add_message(Message::user("uuuu"));
        ctx.add_message(Message::assistant("aaaa"));
        ctx.add_message(Message::user("uuuu"));
        let stats = ctx.stats();
        assert_eq!(stats.message_count, 4);
        assert_eq!(stats.user_messages, 2);
        assert_eq!(stats.assistant_messages, 1);
        assert_eq!(stats.system_messages, 1);
        assert_eq!(stats.estimated_tokens, 4);
    }

    #[test]
    fn test_prune_listener_receives_dropped_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ContextManager::with_config(unlimited_tokens(1));
        ctx.set_prune_listener(tx);
        ctx.add_message(Message::user("first"));
        ctx.add_message(Message::assistant("second"));

        let event = rx.try_recv().expect("prune event");
        assert_eq!(event.pruned, vec![Message::user("first")]);
        assert!(event.summary.contains("1 user message(s)"));
    }

    #[test]
    fn test_reset_keeps_limits() {
        let ctx = ContextManager::with_config(unlimited_tokens(1));
        ctx.add_message(Message::user("a"));
        ctx.add_message(Message::user("b"));
        ctx.reset();
        assert!(ctx.is_empty());
        assert_eq!(ctx.pruned_count(), 0);
        assert_eq!(ctx.config().max_messages, 1);
    }
}
