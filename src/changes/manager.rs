//! 变更管理器：多文件变更的应用与回滚
//!
//! 同一时刻至多一个「当前」变更集（打开、可追加）；应用成功后移入只追加的历史。
//! 应用到第 k 个变更失败时，按逆序回滚 [0, k) 并返回原始错误，变更集不进入历史。
//!
//! 注意：回滚是尽力而为（重新执行逆操作），不是真正的事务；
//! 应用或回滚中途进程崩溃可能留下新旧混合的文件状态。

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::changes::{ChangeSet, ChangeType, FileChange, Storage};
use crate::core::error::{ChangeError, RollbackFailure};

#[derive(Default)]
struct Inner {
    current: Option<ChangeSet>,
    history: Vec<ChangeSet>,
}

/// 变更管理器；所有对 Storage 的写入都经由这里
pub struct ChangeManager {
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
}

impl ChangeManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 只读访问（工具读取旧内容用）
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// 打开新的变更集，替换尚未应用的当前集
    pub fn start_change_set(&self, name: impl Into<String>, description: impl Into<String>) -> ChangeSet {
        let cs = ChangeSet::new(name, description);
        let mut inner = self.lock();
        if let Some(old) = inner.current.replace(cs.clone()) {
            tracing::debug!(id = %old.id, "open change set replaced");
        }
        cs
    }

    /// 追加变更；没有打开的变更集时自动创建
    pub fn add_change(&self, mut change: FileChange) -> FileChange {
        let mut inner = self.lock();
        let cs = inner.current.get_or_insert_with(|| {
            ChangeSet::new("Auto-generated", "Automatically created change set")
        });
        if change.id.is_empty() {
            change.id = format!("change_{}", cs.changes.len());
        }
        cs.changes.push(change.clone());
        change
    }

    pub fn add_file_create(
        &self,
        path: impl Into<PathBuf>,
        content: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> FileChange {
        self.add_change(FileChange::create(path, content, description))
    }

    pub fn add_file_modify(
        &self,
        path: impl Into<PathBuf>,
        old_content: impl Into<Vec<u8>>,
        new_content: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> FileChange {
        self.add_change(FileChange::modify(path, old_content, new_content, description))
    }

    pub fn add_file_delete(
        &self,
        path: impl Into<PathBuf>,
        old_content: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> FileChange {
        self.add_change(FileChange::delete(path, old_content, description))
    }

    pub fn add_file_rename(
        &self,
        old_path: impl Into<PathBuf>,
        new_path: impl Into<PathBuf>,
        description: impl Into<String>,
    ) -> FileChange {
        self.add_change(FileChange::rename(old_path, new_path, description))
    }

    pub fn current_change_set(&self) -> Option<ChangeSet> {
        self.lock().current.clone()
    }

    /// 按顺序应用当前变更集
    pub fn apply_change_set(&self) -> Result<ChangeSet, ChangeError> {
        let mut inner = self.lock();
        let mut cs = inner.current.take().ok_or(ChangeError::NoActiveChangeSet)?;

        for k in 0..cs.changes.len() {
            if let Err(source) = apply_one(self.storage.as_ref(), &cs.changes[k]) {
                let path = cs.changes[k].path.clone();
                tracing::warn!(
                    change_set = %cs.id,
                    path = %path.display(),
                    error = %source,
                    "apply failed, rolling back {} applied change(s)",
                    k
                );
                let rollback_failures = rollback_applied(self.storage.as_ref(), &mut cs.changes[..k]);
                for change in &mut cs.changes {
                    change.reset_flags();
                }
                inner.current = Some(cs);
                return Err(ChangeError::Apply {
                    path,
                    source,
                    rollback_failures,
                });
            }
            let change = &mut cs.changes[k];
            change.applied = true;
            change.applied_at = Some(Utc::now());
        }

        cs.applied_at = Some(Utc::now());
        tracing::info!(change_set = %cs.id, files = cs.changes.len(), "change set applied");
        inner.history.push(cs.clone());
        Ok(cs)
    }

    /// 回滚最近一次已应用的变更集（不是当前打开的那个）
    pub fn rollback_change_set(&self) -> Result<ChangeSet, ChangeError> {
        let mut inner = self.lock();
        let cs = inner
            .history
            .last_mut()
            .ok_or(ChangeError::NothingToRollback)?;
        if cs.rolled_back {
            return Err(ChangeError::AlreadyRolledBack(cs.id.clone()));
        }

        let failures = rollback_applied(self.storage.as_ref(), &mut cs.changes);
        if !failures.is_empty() {
            return Err(ChangeError::RollbackIncomplete { failures });
        }
        cs.rolled_back = true;
        tracing::info!(change_set = %cs.id, "change set rolled back");
        Ok(cs.clone())
    }

    /// 丢弃未应用的当前变更集，不触碰存储
    pub fn discard_current_change_set(&self) -> Option<ChangeSet> {
        self.lock().current.take()
    }

    pub fn history(&self) -> Vec<ChangeSet> {
        self.lock().history.clone()
    }

    /// 当前变更集的文本预览
    pub fn preview_changes(&self) -> String {
        let inner = self.lock();
        let cs = match inner.current.as_ref() {
            Some(cs) if !cs.changes.is_empty() => cs,
            _ => return "No pending changes".to_string(),
        };

        let mut out = format!(
            "Change Set: {}\nDescription: {}\nFiles: {}\n\n",
            cs.name,
            cs.description,
            cs.changes.len()
        );
        for (i, change) in cs.changes.iter().enumerate() {
            let (added, removed) = change.lines_changed();
            out.push_str(&format!(
                "{}. {} {} (+{} -{})\n",
                i + 1,
                change.change_type.icon(),
                change.path.display(),
                added,
                removed
            ));
            if !change.description.is_empty() {
                out.push_str(&format!("   {}\n", change.description));
            }
        }
        out
    }
}

fn missing_old_path(change: &FileChange) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("rename of {} has no source path", change.path.display()),
    )
}

fn apply_one(storage: &dyn Storage, change: &FileChange) -> io::Result<()> {
    match change.change_type {
        ChangeType::Create | ChangeType::Modify => {
            storage.write(&change.path, &change.new_content)
        }
        ChangeType::Delete => storage.delete(&change.path),
        ChangeType::Rename => {
            let from = change.old_path.as_ref().ok_or_else(|| missing_old_path(change))?;
            storage.rename(from, &change.path)
        }
    }
}

fn rollback_one(storage: &dyn Storage, change: &FileChange) -> io::Result<()> {
    match change.change_type {
        ChangeType::Create => storage.delete(&change.path),
        ChangeType::Modify | ChangeType::Delete => {
            storage.write(&change.path, &change.old_content)
        }
        ChangeType::Rename => {
            let to = change.old_path.as_ref().ok_or_else(|| missing_old_path(change))?;
            storage.rename(&change.path, to)
        }
    }
}

/// 逆序回滚已应用且未回滚的变更；失败项记录后继续
fn rollback_applied(storage: &dyn Storage, changes: &mut [FileChange]) -> Vec<RollbackFailure> {
    let mut failures = Vec::new();
    for change in changes.iter_mut().rev() {
        if !change.applied || change.rolled_back {
            continue;
        }
        match rollback_one(storage, change) {
            Ok(()) => {
                change.rolled_back = true;
                change.rolled_back_at = Some(Utc::now());
            }
            Err(error) => {
                tracing::warn!(path = %change.path.display(), error = %error, "rollback failed");
                failures.push(RollbackFailure {
                    path: change.path.clone(),
                    error,
                });
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::changes::{FsStorage, MemoryStorage};

    /// 对指定路径的写入总是失败
    struct FailingStorage {
        inner: MemoryStorage,
        fail_path: PathBuf,
    }

    impl Storage for FailingStorage {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.inner.read(path)
        }
        fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
            if path == self.fail_path {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
            }
            self.inner.write(path, bytes)
        }
        fn delete(&self, path: &Path) -> io::Result<()> {
            self.inner.delete(path)
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.inner.rename(from, to)
        }
    }

    #[test]
    fn test_third_modify_fails_first_two_restored() {
        let storage = Arc::new(FailingStorage {
            inner: MemoryStorage::new(),
            fail_path: PathBuf::from("c.txt"),
        });
        for (p, c) in [("a.txt", "old a"), ("b.txt", "old b"), ("c.txt", "old c")] {
            storage.inner.write(Path::new(p), c.as_bytes()).unwrap();
        }
        let cm = ChangeManager::new(storage.clone());
        cm.start_change_set("edit", "three files");
        cm.add_file_modify("a.txt", "old a", "new a", "");
        cm.add_file_modify("b.txt", "old b", "new b", "");
        cm.add_file_modify("c.txt", "old c", "new c", "");

        let err = cm.apply_change_set().unwrap_err();
        match err {
            ChangeError::Apply {
                path,
                rollback_failures,
                ..
            } => {
                assert_eq!(path, PathBuf::from("c.txt"));
                assert!(rollback_failures.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(storage.read(Path::new("a.txt")).unwrap(), b"old a");
        assert_eq!(storage.read(Path::new("b.txt")).unwrap(), b"old b");
        assert!(cm.history().is_empty());

        let current = cm.current_change_set().expect("set stays open");
        assert!(current.changes.iter().all(|c| !c.applied && !c.rolled_back));
    }

    #[test]
    fn test_modify_then_rollback_restores_bytes() {
        let dir = TempDir::new().unwrap();
        let original = "line one\r\nline two\n\u{1F980} tail";
        std::fs::write(dir.path().join("lib.rs"), original).unwrap();

        let cm = ChangeManager::new(Arc::new(FsStorage::new(dir.path())));
        cm.add_file_modify("lib.rs", original, "rewritten", "rewrite");
        let applied = cm.apply_change_set().unwrap();
        assert!(applied.applied_at.is_some());
        assert_eq!(std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "rewritten");

        let rolled = cm.rollback_change_set().unwrap();
        assert!(rolled.rolled_back);
        assert_eq!(
            std::fs::read(dir.path().join("lib.rs")).unwrap(),
            original.as_bytes()
        );
        assert!(matches!(
            cm.rollback_change_set(),
            Err(ChangeError::AlreadyRolledBack(_))
        ));
    }

    #[test]
    fn test_rollback_each_change_type() {
        let storage = Arc::new(MemoryStorage::new());
        storage.write(Path::new("gone.txt"), b"keep me").unwrap();
        storage.write(Path::new("from.txt"), b"moving").unwrap();

        let cm = ChangeManager::new(storage.clone());
        cm.start_change_set("mixed", "");
        cm.add_file_create("new.txt", "fresh", "");
        cm.add_file_delete("gone.txt", "keep me", "");
        cm.add_file_rename("from.txt", "to.txt", "");
        cm.apply_change_set().unwrap();

        assert!(storage.exists("new.txt"));
        assert!(!storage.exists("gone.txt"));
        assert!(storage.exists("to.txt"));

        cm.rollback_change_set().unwrap();
        assert!(!storage.exists("new.txt"));
        assert_eq!(storage.read(Path::new("gone.txt")).unwrap(), b"keep me");
        assert_eq!(storage.read(Path::new("from.txt")).unwrap(), b"moving");
        assert!(!storage.exists("to.txt"));
    }

    #[test]
    fn test_auto_created_set_and_ids() {
        let cm = ChangeManager::new(Arc::new(MemoryStorage::new()));
        let first = cm.add_file_create("a", "1", "");
        let second = cm.add_file_create("b", "2", "");
        assert_eq!(first.id, "change_0");
        assert_eq!(second.id, "change_1");
        assert_eq!(cm.current_change_set().unwrap().name, "Auto-generated");
    }

    #[test]
    fn test_errors_without_sets() {
        let cm = ChangeManager::new(Arc::new(MemoryStorage::new()));
        assert!(matches!(
            cm.apply_change_set(),
            Err(ChangeError::NoActiveChangeSet)
        ));
        assert!(matches!(
            cm.rollback_change_set(),
            Err(ChangeError::NothingToRollback)
        ));
    }

    #[test]
    fn test_discard_has_no_storage_effect() {
        let storage = Arc::new(MemoryStorage::new());
        let cm = ChangeManager::new(storage.clone());
        cm.add_file_create("a.txt", "x", "");
        let discarded = cm.discard_current_change_set().unwrap();
        assert_eq!(discarded.changes.len(), 1);
        assert!(cm.current_change_set().is_none());
        assert!(storage.paths().is_empty());
    }

    #[test]
    fn test_preview() {
        let cm = ChangeManager::new(Arc::new(MemoryStorage::new()));
        assert_eq!(cm.preview_changes(), "No pending changes");
        cm.start_change_set("docs", "update readme");
        cm.add_file_modify("README.md", "a", "b", "fix typo");
        let preview = cm.preview_changes();
        assert!(preview.starts_with("Change Set: docs\nDescription: update readme\nFiles: 1\n\n"));
        assert!(preview.contains("1. ~ README.md (+1 -1)\n   fix typo\n"));
    }

    #[test]
    fn test_history_keeps_applied_sets_in_order() {
        let cm = ChangeManager::new(Arc::new(MemoryStorage::new()));
        cm.start_change_set("one", "");
        cm.add_file_create("1.txt", "1", "");
        cm.apply_change_set().unwrap();
        cm.start_change_set("two", "");
        cm.add_file_create("2.txt", "2", "");
        cm.apply_change_set().unwrap();

        let names: Vec<String> = cm.history().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert!(cm.current_change_set().is_none());

        // 只回滚最近一次
        let rolled = cm.rollback_change_set().unwrap();
        assert_eq!(rolled.name, "two");
    }
}
