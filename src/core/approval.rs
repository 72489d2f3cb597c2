//! 审批闸门：有副作用的工具调用在执行前需人工确认
//!
//! ApprovalManager 只改状态，不执行任何工具；批准后的执行由 Agent 完成。
//! 状态只允许 Pending→Approved / Pending→Rejected，其它转移返回 AlreadyResolved 且不生效。

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::core::error::ApprovalError;
use crate::tools::{ApprovalRequest, ToolCall};

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApprovalStatus::Pending => "Pending",
            ApprovalStatus::Approved => "Approved",
            ApprovalStatus::Rejected => "Rejected",
        })
    }
}

/// 单个审批项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalItem {
    pub id: String,
    pub tool_call: ToolCall,
    pub request: ApprovalRequest,
    pub status: ApprovalStatus,
    /// 拒绝原因
    pub reason: Option<String>,
}

/// 审批决定回调，在锁外调用
pub type ApprovalCallback = Arc<dyn Fn(&ApprovalItem) + Send + Sync>;

#[derive(Default)]
struct Inner {
    items: Vec<ApprovalItem>,
    next_id: u64,
    callback: Option<ApprovalCallback>,
}

/// FIFO 审批注册表
#[derive(Default)]
pub struct ApprovalManager {
    inner: Mutex<Inner>,
}

impl fmt::Debug for ApprovalManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalManager")
            .field("items", &self.lock().items)
            .finish()
    }
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_callback(&self, callback: ApprovalCallback) {
        self.lock().callback = Some(callback);
    }

    /// 新建 Pending 项；id 为单调递增的 approval_N，清理后也不复用
    pub fn add(&self, tool_call: ToolCall, request: ApprovalRequest) -> ApprovalItem {
        let mut inner = self.lock();
        let item = ApprovalItem {
            id: format!("approval_{}", inner.next_id),
            tool_call,
            request,
            status: ApprovalStatus::Pending,
            reason: None,
        };
        inner.next_id += 1;
        inner.items.push(item.clone());
        item
    }

    /// 批量添加（来自一次 AgentResponse 的待审批列表）
    pub fn add_pending<I>(&self, pending: I) -> Vec<ApprovalItem>
    where
        I: IntoIterator<Item = (ToolCall, ApprovalRequest)>,
    {
        pending
            .into_iter()
            .map(|(call, request)| self.add(call, request))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<ApprovalItem, ApprovalError> {
        self.lock()
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))
    }

    /// 按插入顺序返回 Pending 项
    pub fn pending(&self) -> Vec<ApprovalItem> {
        self.lock()
            .items
            .iter()
            .filter(|i| i.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<ApprovalItem> {
        self.lock().items.clone()
    }

    pub fn approve(&self, id: &str) -> Result<ApprovalItem, ApprovalError> {
        self.resolve(id, ApprovalStatus::Approved, None)
    }

    pub fn reject(&self, id: &str, reason: impl Into<String>) -> Result<ApprovalItem, ApprovalError> {
        self.resolve(id, ApprovalStatus::Rejected, Some(reason.into()))
    }

    fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> Result<ApprovalItem, ApprovalError> {
        let (item, callback) = {
            let mut inner = self.lock();
            let item = inner
                .items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
            if item.status != ApprovalStatus::Pending {
                return Err(ApprovalError::AlreadyResolved {
                    id: id.to_string(),
                    status: item.status,
                });
            }
            item.status = status;
            item.reason = reason;
            let item = item.clone();
            (item, inner.callback.clone())
        };

        tracing::info!(id = %item.id, tool = %item.tool_call.name, status = %item.status, "approval resolved");
        if let Some(cb) = callback {
            cb(&item);
        }
        Ok(item)
    }

    /// 批准全部 Pending，返回成功的 id
    pub fn approve_all(&self) -> Vec<String> {
        self.pending()
            .into_iter()
            .filter_map(|i| self.approve(&i.id).ok().map(|i| i.id))
            .collect()
    }

    pub fn reject_all(&self, reason: &str) -> Vec<String> {
        self.pending()
            .into_iter()
            .filter_map(|i| self.reject(&i.id, reason).ok().map(|i| i.id))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.lock()
            .items
            .iter()
            .any(|i| i.status == ApprovalStatus::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .items
            .iter()
            .filter(|i| i.status == ApprovalStatus::Pending)
            .count()
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }

    /// 只保留 Pending 项
    pub fn clear_resolved(&self) {
        self.lock()
            .items
            .retain(|i| i.status == ApprovalStatus::Pending);
    }
}

/// 供终端展示的审批说明
pub fn format_approval_request(item: &ApprovalItem) -> String {
    let mut out = format!(
        "Action: {}\nReason: {}\n",
        item.request.action, item.request.reason
    );
    if item.request.destructive {
        out.push_str("⚠️  This is a destructive operation\n");
    }
    if let Some(preview) = item.request.preview.as_deref().filter(|p| !p.is_empty()) {
        out.push_str(&format!("\nPreview:\n{}\n", preview));
    }
    out.push_str(&format!("\nTool: {}\n", item.tool_call.name));
    if !item.tool_call.arguments.is_empty() {
        out.push_str("Arguments:\n");
        for (key, val) in &item.tool_call.arguments {
            out.push_str(&format!("  {}: {}\n", key, val));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use serde_json::json;

    use super::*;

    fn call(name: &str) -> ToolCall {
        ToolCall::new("call_0", name, json!({"path": "a.txt"}))
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            action: "Write a.txt".into(),
            reason: "modifies the workspace".into(),
            destructive: false,
            preview: None,
        }
    }

    #[test]
    fn test_pending_in_insertion_order() {
        let am = ApprovalManager::new();
        let a = am.add(call("write_file"), request());
        let b = am.add(call("delete_file"), request());
        assert_eq!(a.id, "approval_0");
        assert_eq!(b.id, "approval_1");
        let ids: Vec<String> = am.pending().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["approval_0", "approval_1"]);
        assert_eq!(am.pending_count(), 2);
    }

    #[test]
    fn test_second_resolution_fails_and_keeps_status() {
        let am = ApprovalManager::new();
        let item = am.add(call("write_file"), request());
        am.approve(&item.id).unwrap();

        let err = am.reject(&item.id, "too late").unwrap_err();
        assert_eq!(
            err,
            ApprovalError::AlreadyResolved {
                id: item.id.clone(),
                status: ApprovalStatus::Approved
            }
        );
        let stored = am.get(&item.id).unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert!(stored.reason.is_none());
    }

    #[test]
    fn test_concurrent_approve_reject_resolves_once() {
        for _ in 0..50 {
            let am = Arc::new(ApprovalManager::new());
            let id = am.add(call("write_file"), request()).id;

            let a = {
                let am = am.clone();
                let id = id.clone();
                thread::spawn(move || am.approve(&id).map(|i| i.status))
            };
            let b = {
                let am = am.clone();
                let id = id.clone();
                thread::spawn(move || am.reject(&id, "no").map(|i| i.status))
            };
            let ra = a.join().unwrap();
            let rb = b.join().unwrap();

            assert!(ra.is_ok() ^ rb.is_ok());
            let winner = ra.or(rb).unwrap();
            assert_eq!(am.get(&id).unwrap().status, winner);
        }
    }

    #[test]
    fn test_unknown_id() {
        let am = ApprovalManager::new();
        assert_eq!(
            am.approve("approval_9").unwrap_err(),
            ApprovalError::NotFound("approval_9".into())
        );
        assert!(am.get("approval_9").is_err());
    }

    #[test]
    fn test_ids_not_reused_after_clear_resolved() {
        let am = ApprovalManager::new();
        let first = am.add(call("write_file"), request());
        let second = am.add(call("write_file"), request());
        am.approve(&first.id).unwrap();
        am.clear_resolved();

        assert_eq!(am.all().len(), 1);
        let third = am.add(call("write_file"), request());
        assert_ne!(third.id, second.id);
        assert_eq!(third.id, "approval_2");
    }

    #[test]
    fn test_batch_operations() {
        let am = ApprovalManager::new();
        am.add_pending(vec![
            (call("write_file"), request()),
            (call("delete_file"), request()),
        ]);
        let approved = am.approve_all();
        assert_eq!(approved.len(), 2);
        assert!(!am.has_pending());
        assert!(am.approve_all().is_empty());

        am.add(call("write_file"), request());
        let rejected = am.reject_all("user declined");
        assert_eq!(rejected, vec!["approval_2".to_string()]);
        assert_eq!(
            am.get("approval_2").unwrap().reason.as_deref(),
            Some("user declined")
        );
    }

    #[test]
    fn test_callback_sees_resolved_item() {
        let am = Arc::new(ApprovalManager::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let am2 = am.clone();
        am.set_callback(Arc::new(move |item: &ApprovalItem| {
            assert_eq!(item.status, ApprovalStatus::Approved);
            // 回调在锁外执行，可重入读取
            assert!(!am2.has_pending());
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        let item = am.add(call("write_file"), request());
        am.approve(&item.id).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_format_approval_request() {
        let am = ApprovalManager::new();
        let item = am.add(
            call("delete_file"),
            ApprovalRequest {
                action: "Delete a.txt".into(),
                reason: "removes a file".into(),
                destructive: true,
                preview: Some("- old".into()),
            },
        );
        let text = format_approval_request(&item);
        assert!(text.starts_with("Action: Delete a.txt\nReason: removes a file\n"));
        assert!(text.contains("destructive"));
        assert!(text.contains("Preview:\n- old"));
        assert!(text.contains("Tool: delete_file"));
        assert!(text.contains("  path: \"a.txt\""));
    }
}
