//! 执行器通知事件：error / retry / recovery / 熔断开合
//!
//! 通过 broadcast 扇出；订阅者持有 Subscription，调用 unsubscribe 或 drop 即退订。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::ErrorKind;

use super::CallContext;

/// 执行器事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutorEvent {
    Error {
        context: CallContext,
        kind: ErrorKind,
        attempt: u32,
        message: String,
    },
    Retry {
        context: CallContext,
        attempt: u32,
        delay_ms: u64,
    },
    /// 至少失败一次后成功
    Recovery { context: CallContext, attempts: u32 },
    CircuitBreakerOpened {
        service: String,
        operation: String,
        failures: u32,
    },
    CircuitBreakerClosed { service: String, operation: String },
}

impl ExecutorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutorEvent::Error { .. } => "error",
            ExecutorEvent::Retry { .. } => "retry",
            ExecutorEvent::Recovery { .. } => "recovery",
            ExecutorEvent::CircuitBreakerOpened { .. } => "circuit-breaker-opened",
            ExecutorEvent::CircuitBreakerClosed { .. } => "circuit-breaker-closed",
        }
    }
}

/// 事件订阅句柄
pub struct Subscription {
    rx: broadcast::Receiver<ExecutorEvent>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<ExecutorEvent>) -> Self {
        Self { rx }
    }

    /// 等待下一个事件；落后太多时跳过丢失部分继续读
    pub async fn recv(&mut self) -> Option<ExecutorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "executor event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞读取当前已到达的全部事件
    pub fn drain(&mut self) -> Vec<ExecutorEvent> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        out
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}
