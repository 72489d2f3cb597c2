//! 记忆层：对话消息、有界上下文、会话持久化

pub mod context;
pub mod conversation;
pub mod persistence;

pub use context::{ContextConfig, ContextManager, ContextStats, PruneEvent, DEFAULT_CHARS_PER_TOKEN};
pub use conversation::{Message, Role};
pub use persistence::{Session, SessionInfo, SessionStore};
