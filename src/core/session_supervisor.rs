//! 会话监管：取消令牌
//!
//! 每个请求拿一个子 token；用户取消时触发当前 token。已取消的 token 不能复用，
//! 因此 `renew` 在下一个请求前换一个新的根 token。

use tokio_util::sync::CancellationToken;

/// 会话级取消管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户 Ctrl+C / Cancel 命令）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 若已取消则换新 token，返回是否发生了替换
    pub fn renew(&mut self) -> bool {
        if self.cancel_token.is_cancelled() {
            self.cancel_token = CancellationToken::new();
            true
        } else {
            false
        }
    }

    /// 创建子 token（用于单个请求或工具调用）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_reaches_children_and_renew_resets() {
        let mut sup = SessionSupervisor::new();
        let child = sup.child_token();
        sup.cancel();
        assert!(child.is_cancelled());
        assert!(sup.renew());
        assert!(!sup.is_cancelled());
        assert!(!sup.child_token().is_cancelled());
        assert!(!sup.renew());
    }
}
