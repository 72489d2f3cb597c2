//! 变更层：文件变更集、存储能力、应用与回滚

pub mod change_set;
pub mod manager;
pub mod storage;

pub use change_set::{ChangeSet, ChangeType, FileChange};
pub use manager::ChangeManager;
pub use storage::{FsStorage, MemoryStorage, Storage};
