//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径必须在 root 下（禁止 `..` 与绝对路径逃逸）。
//! read_file / list_dir 直接读取；write_file / delete_file 总是需要审批，
//! 且只通过共享的 ChangeManager 修改文件，因此可以回滚。

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::changes::{ChangeManager, ChangeType, FileChange};
use crate::core::AgentError;
use crate::tools::{ApprovalRequest, Tool};

/// 沙箱文件系统：绑定根目录，校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法校验：只允许普通路径段，返回相对 root 的路径
    pub fn relative(&self, path: &str) -> Result<PathBuf, AgentError> {
        let mut rel = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => rel.push(part),
                Component::CurDir => {}
                _ => return Err(AgentError::PathEscape(path.to_string())), // 如 ../../etc/passwd
            }
        }
        if rel.as_os_str().is_empty() {
            return Err(AgentError::ToolExecutionFailed("path is required".to_string()));
        }
        Ok(rel)
    }

    /// 写入/删除目标的校验：词法校验后，取最深的已存在祖先（含目标自身）做 canonicalize，
    /// 必须仍在 root 下，防止经符号链接写到沙箱外。悬空链接同样拒绝。
    pub fn writable(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = self.relative(path)?;
        let root = self
            .root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone());
        let mut cursor = root.join(&rel);
        loop {
            if cursor.symlink_metadata().is_ok() {
                let canonical = cursor
                    .canonicalize()
                    .map_err(|_| AgentError::PathEscape(path.to_string()))?;
                if !canonical.starts_with(&root) {
                    return Err(AgentError::PathEscape(path.to_string()));
                }
                return Ok(rel);
            }
            if cursor == root || !cursor.pop() {
                return Ok(rel);
            }
        }
    }

    /// 已存在路径的完整校验（含符号链接）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = self.relative(path)?;
        let canonical = self
            .root_dir
            .join(&rel)
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {}", path)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string()))
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {}", e)))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn path_schema(extra: Option<(&str, &str)>) -> Value {
    let mut props = serde_json::json!({
        "path": { "type": "string", "description": "path relative to the workspace root" }
    });
    let mut required = vec!["path".to_string()];
    if let (Some((name, desc)), Some(map)) = (extra, props.as_object_mut()) {
        map.insert(
            name.to_string(),
            serde_json::json!({ "type": "string", "description": desc }),
        );
        required.push(name.to_string());
    }
    serde_json::json!({ "type": "object", "properties": props, "required": required })
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(None)
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = str_arg(&args, "path");
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(path).map_err(|e| e.to_string())
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory (default '.')."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "directory relative to the workspace root" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        Ok(entries.join("\n"))
    }
}

/// 写文件：新建或覆盖，经 ChangeManager 应用
pub struct WriteFileTool {
    fs: SafeFs,
    changes: Arc<ChangeManager>,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>, changes: Arc<ChangeManager>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            changes,
        }
    }

    /// 只有 NotFound 表示新建；其它读取错误不能当作文件不存在
    fn old_content(&self, rel: &Path) -> Result<Option<Vec<u8>>, AgentError> {
        match self.changes.storage().read(rel) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::ToolExecutionFailed(format!(
                "Read failed: {}: {}",
                rel.display(),
                e
            ))),
        }
    }

    fn planned_change(&self, args: &Value) -> Result<FileChange, AgentError> {
        let path = str_arg(args, "path");
        let content = str_arg(args, "content");
        let rel = self.fs.writable(path)?;
        let description = format!("Write {}", rel.display());
        Ok(match self.old_content(&rel)? {
            Some(old) => FileChange::modify(rel, old, content, description),
            None => FileChange::create(rel, content, description),
        })
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a workspace file (requires approval)."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(Some(("content", "full new file content")))
    }

    fn approval_request(&self, args: &Value) -> Option<ApprovalRequest> {
        let path = str_arg(args, "path");
        let (preview, overwrite) = match self.planned_change(args) {
            Ok(change) => {
                let overwrite = change.change_type == ChangeType::Modify;
                (Some(change.diff), overwrite)
            }
            Err(_) => (None, true),
        };
        Some(ApprovalRequest {
            action: format!("Write file {}", path),
            reason: "Modifies files in the workspace".to_string(),
            destructive: overwrite,
            preview,
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let change = self.planned_change(&args).map_err(|e| e.to_string())?;
        let path = change.path.display().to_string();
        let bytes = change.new_content.len();
        tracing::info!(path = %path, "write_file tool execute");

        self.changes.start_change_set(format!("write {}", path), change.description.clone());
        self.changes.add_change(change);
        self.changes.apply_change_set().map_err(|e| {
            self.changes.discard_current_change_set();
            e.to_string()
        })?;
        Ok(format!("Wrote {} bytes to {}", bytes, path))
    }
}

/// 删除文件，经 ChangeManager 应用（可回滚）
pub struct DeleteFileTool {
    fs: SafeFs,
    changes: Arc<ChangeManager>,
}

impl DeleteFileTool {
    pub fn new(root_dir: impl AsRef<Path>, changes: Arc<ChangeManager>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            changes,
        }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a workspace file (requires approval)."
    }

    fn parameters_schema(&self) -> Value {
        path_schema(None)
    }

    fn approval_request(&self, args: &Value) -> Option<ApprovalRequest> {
        let path = str_arg(args, "path");
        let preview = self.fs.writable(path).ok().and_then(|rel| {
            let old = self.changes.storage().read(&rel).ok()?;
            Some(FileChange::delete(rel, old, "").diff)
        });
        Some(ApprovalRequest {
            action: format!("Delete file {}", path),
            reason: "Removes a file from the workspace".to_string(),
            destructive: true,
            preview,
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = str_arg(&args, "path");
        let rel = self.fs.writable(path).map_err(|e| e.to_string())?;
        let old = self
            .changes
            .storage()
            .read(&rel)
            .map_err(|e| format!("Delete failed: {}", e))?;
        tracing::info!(path = %rel.display(), "delete_file tool execute");

        self.changes
            .start_change_set(format!("delete {}", rel.display()), format!("Delete {}", rel.display()));
        self.changes.add_file_delete(&rel, old, "");
        self.changes.apply_change_set().map_err(|e| {
            self.changes.discard_current_change_set();
            e.to_string()
        })?;
        Ok(format!("Deleted {}", rel.display()))
    }
}
