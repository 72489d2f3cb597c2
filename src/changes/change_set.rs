//! 文件变更与变更集
//!
//! 每个 FileChange 在创建时合成一段 unified 风格的 diff 供预览；
//! diff 只是逐行全量对比（旧内容全部 `-`，新内容全部 `+`），不是最小编辑距离。
//! 内容按原始字节保存，应用与回滚都逐字节写回；非 UTF-8 内容的 diff 只显示一行 `Binary files ... differ`。

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
    Rename,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Modify => "modify",
            ChangeType::Delete => "delete",
            ChangeType::Rename => "rename",
        }
    }

    /// 列表展示用的图标
    pub fn icon(&self) -> &'static str {
        match self {
            ChangeType::Create => "+",
            ChangeType::Modify => "~",
            ChangeType::Delete => "-",
            ChangeType::Rename => "→",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个文件变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub id: String,
    pub path: PathBuf,
    /// 仅 Rename
    pub old_path: Option<PathBuf>,
    pub change_type: ChangeType,
    #[serde(skip)]
    pub old_content: Vec<u8>,
    #[serde(skip)]
    pub new_content: Vec<u8>,
    pub diff: String,
    pub description: String,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back: bool,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl FileChange {
    fn new(path: PathBuf, change_type: ChangeType, description: String) -> Self {
        Self {
            id: String::new(),
            path,
            old_path: None,
            change_type,
            old_content: Vec::new(),
            new_content: Vec::new(),
            diff: String::new(),
            description,
            applied: false,
            applied_at: None,
            rolled_back: false,
            rolled_back_at: None,
        }
    }

    pub fn create(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>, description: impl Into<String>) -> Self {
        let mut change = Self::new(path.into(), ChangeType::Create, description.into());
        change.new_content = content.into();
        change.diff = create_diff(&change.path, &change.new_content);
        change
    }

    pub fn modify(
        path: impl Into<PathBuf>,
        old_content: impl Into<Vec<u8>>,
        new_content: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> Self {
        let mut change = Self::new(path.into(), ChangeType::Modify, description.into());
        change.old_content = old_content.into();
        change.new_content = new_content.into();
        change.diff = modify_diff(&change.path, &change.old_content, &change.new_content);
        change
    }

    pub fn delete(path: impl Into<PathBuf>, old_content: impl Into<Vec<u8>>, description: impl Into<String>) -> Self {
        let mut change = Self::new(path.into(), ChangeType::Delete, description.into());
        change.old_content = old_content.into();
        change.diff = delete_diff(&change.path, &change.old_content);
        change
    }

    pub fn rename(old_path: impl Into<PathBuf>, new_path: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        let old_path = old_path.into();
        let mut change = Self::new(new_path.into(), ChangeType::Rename, description.into());
        change.diff = format!("rename {} -> {}", old_path.display(), change.path.display());
        change.old_path = Some(old_path);
        change
    }

    /// (新增行数, 删除行数)，按 diff 统计
    pub fn lines_changed(&self) -> (usize, usize) {
        self.diff.lines().fold((0, 0), |(added, removed), line| {
            if line.starts_with('+') && !line.starts_with("+++") {
                (added + 1, removed)
            } else if line.starts_with('-') && !line.starts_with("---") {
                (added, removed + 1)
            } else {
                (added, removed)
            }
        })
    }

    /// 内容（非 UTF-8 时做有损解码，只用于展示）
    pub fn new_text(&self) -> String {
        String::from_utf8_lossy(&self.new_content).into_owned()
    }

    pub fn old_text(&self) -> String {
        String::from_utf8_lossy(&self.old_content).into_owned()
    }

    pub(crate) fn reset_flags(&mut self) {
        self.applied = false;
        self.applied_at = None;
        self.rolled_back = false;
        self.rolled_back_at = None;
    }
}

fn binary_diff(path: &Path, old: &str, new: &str) -> String {
    let p = path.display();
    format!("diff --git a/{p} b/{p}\nBinary files {old} and {new} differ\n")
}

fn create_diff(path: &Path, content: &[u8]) -> String {
    let Ok(content) = std::str::from_utf8(content) else {
        return binary_diff(path, "/dev/null", &format!("b/{}", path.display()));
    };
    let p = path.display();
    let lines: Vec<&str> = content.split('\n').collect();
    let mut diff = format!(
        "diff --git a/{p} b/{p}\nnew file mode 100644\n--- /dev/null\n+++ b/{p}\n@@ -0,0 +1,{} @@\n",
        lines.len()
    );
    for line in lines {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

fn delete_diff(path: &Path, content: &[u8]) -> String {
    let Ok(content) = std::str::from_utf8(content) else {
        return binary_diff(path, &format!("a/{}", path.display()), "/dev/null");
    };
    let p = path.display();
    let lines: Vec<&str> = content.split('\n').collect();
    let mut diff = format!(
        "diff --git a/{p} b/{p}\ndeleted file mode 100644\n--- a/{p}\n+++ /dev/null\n@@ -1,{} +0,0 @@\n",
        lines.len()
    );
    for line in lines {
        diff.push('-');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

fn modify_diff(path: &Path, old: &[u8], new: &[u8]) -> String {
    let (Ok(old), Ok(new)) = (std::str::from_utf8(old), std::str::from_utf8(new)) else {
        let p = path.display();
        return binary_diff(path, &format!("a/{p}"), &format!("b/{p}"));
    };
    let p = path.display();
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let mut diff = format!(
        "diff --git a/{p} b/{p}\n--- a/{p}\n+++ b/{p}\n@@ -1,{} +1,{} @@\n",
        old_lines.len(),
        new_lines.len()
    );
    for line in old_lines {
        diff.push('-');
        diff.push_str(line);
        diff.push('\n');
    }
    for line in new_lines {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

/// 一组相关文件变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub id: String,
    pub name: String,
    pub description: String,
    pub changes: Vec<FileChange>,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub rolled_back: bool,
}

impl ChangeSet {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: format!("cs_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            description: description.into(),
            changes: Vec::new(),
            created_at: Utc::now(),
            applied_at: None,
            rolled_back: false,
        }
    }

    /// "name (N files, +A -R)" 加每个文件一行
    pub fn summary(&self) -> String {
        let (mut added, mut removed) = (0, 0);
        let mut files = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let (a, r) = change.lines_changed();
            added += a;
            removed += r;
            files.push(format!("{} {}", change.change_type.icon(), change.path.display()));
        }
        format!(
            "{} ({} files, +{} -{})\n{}",
            self.name,
            self.changes.len(),
            added,
            removed,
            files.join("\n")
        )
    }

    /// 受影响路径（重命名包含新旧两个路径）
    pub fn affected_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for change in &self.changes {
            files.push(change.path.clone());
            if let Some(old) = &change.old_path {
                files.push(old.clone());
            }
        }
        files
    }
}
