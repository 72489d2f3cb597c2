//! 会话持久化
//!
//! 每个会话一个 pretty JSON 文件（`<session_dir>/<id>.json`）。只通过 ContextManager 的
//! messages / add_message 读写对话，不接触上下文内部状态。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{ContextManager, Message, Role};

/// 会话元信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

/// 一个持久化会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: SessionMeta,
}

impl Session {
    /// id 形如 20260101-120000-1a2b3c4d
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8]),
            name: name.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            metadata: SessionMeta::default(),
        }
    }

    /// 从上下文抓取当前消息
    pub fn capture(&mut self, context: &ContextManager) {
        self.messages = context.messages();
        self.updated_at = Utc::now();
    }

    /// 清空上下文并逐条 add_message 恢复（上下文上限照常生效）
    pub fn restore_into(&self, context: &ContextManager) {
        context.reset();
        for msg in &self.messages {
            context.add_message(msg.clone());
        }
    }

    /// 名称，或第一条用户消息的前 100 个字符
    pub fn preview(&self) -> String {
        if !self.name.is_empty() && self.name != self.id {
            return self.name.clone();
        }
        match self.messages.iter().find(|m| m.role == Role::User) {
            Some(msg) if msg.content.chars().count() > 100 => {
                format!("{}...", msg.content.chars().take(100).collect::<String>())
            }
            Some(msg) => msg.content.clone(),
            None => "Empty session".to_string(),
        }
    }
}

/// 列表用的轻量摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub total_tokens: u64,
    pub preview: String,
}

/// 会话文件目录
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            bail!("invalid session id: {id}");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// 写入会话（更新时间置为当前）；目录不存在时自动创建
    pub fn save(&self, session: &mut Session) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create session dir {}", self.dir.display()))?;
        session.updated_at = Utc::now();
        let path = self.path_for(&session.id)?;
        std::fs::write(&path, serde_json::to_string_pretty(session)?)
            .with_context(|| format!("write session {}", path.display()))?;
        tracing::debug!(id = %session.id, "session saved");
        Ok(())
    }

    pub fn load(&self, id: &str) -> anyhow::Result<Session> {
        let path = self.path_for(id)?;
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("read session {}", path.display()))?;
        let session = serde_json::from_str(&data)
            .with_context(|| format!("parse session {}", path.display()))?;
        Ok(session)
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        let path = self.path_for(id)?;
        std::fs::remove_file(&path).with_context(|| format!("delete session {}", path.display()))?;
        Ok(())
    }

    /// 全部会话，最近更新的在前；损坏的文件跳过
    pub fn list(&self) -> anyhow::Result<Vec<Session>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("read session dir"),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(s) => sessions.push(s),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable session: {e:#}"),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    pub fn list_summaries(&self) -> anyhow::Result<Vec<SessionInfo>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|s| SessionInfo {
                preview: s.preview(),
                id: s.id,
                name: s.name,
                created_at: s.created_at,
                updated_at: s.updated_at,
                message_count: s.messages.len(),
                total_tokens: s.metadata.total_tokens,
            })
            .collect())
    }

    /// 名称或消息内容包含 query（不区分大小写）
    pub fn search(&self, query: &str) -> anyhow::Result<Vec<Session>> {
        let query = query.to_lowercase();
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| {
                s.name.to_lowercase().contains(&query)
                    || s.messages
                        .iter()
                        .any(|m| m.content.to_lowercase().contains(&query))
            })
            .collect())
    }
}
