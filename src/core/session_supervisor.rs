//! 监控监管：所有项目轮询 / 推送任务共享的根取消令牌
//!
//! 每个项目从根令牌派生子令牌；停止单个项目只取消其子令牌，关闭时取消根令牌。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 取消全部项目任务（关闭时）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个项目）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
