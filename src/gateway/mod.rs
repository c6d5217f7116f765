//! Vamsh 网关：HTTP 接口与流式通道的强类型客户端
//!
//! 每个方法只做一次带超时的网络调用（外加很小的内部重试）；
//! 调用方负责在外层套 ResilientExecutor。

pub mod client;
pub mod message;
pub mod stream;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::ServiceError;

pub use client::AgentClient;
pub use message::{AgentMessage, AgentState, HealthReport, StreamFrame};

/// Vamsh 能力抽象；监控与编排只依赖此 trait，测试中可替换为内存实现
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn health(&self) -> Result<HealthReport, ServiceError>;

    /// 健康检查的布尔视图；任何错误都视为不健康
    async fn is_healthy(&self) -> bool {
        self.health().await.map(|h| h.is_healthy()).unwrap_or(false)
    }

    async fn status(&self) -> Result<Value, ServiceError>;

    async fn send_message(&self, project_name: &str, message: &str) -> Result<Value, ServiceError>;

    async fn list_messages(&self, project_name: &str) -> Result<Vec<AgentMessage>, ServiceError>;

    async fn is_agent_active(&self, project_name: &str) -> Result<bool, ServiceError>;

    async fn agent_state(&self, project_name: &str) -> Result<AgentState, ServiceError>;

    /// 启动项目：交接说明作为该项目的首条消息发出
    async fn start_project(&self, project_name: &str, brief: &str) -> Result<Value, ServiceError> {
        self.send_message(project_name, brief).await
    }

    async fn open_stream(&self, project_name: &str) -> Result<AgentStream, ServiceError>;
}

/// 已建立的流式会话：按帧读取，close 或 drop 即断开
pub struct AgentStream {
    frames: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
}

impl AgentStream {
    /// 创建一对（发送端, 会话）；发送端由连接读循环或测试持有
    pub fn channel(buffer: usize) -> (mpsc::Sender<StreamFrame>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Self {
                frames: rx,
                cancel: CancellationToken::new(),
            },
        )
    }

    /// 下一帧；连接断开或被关闭时返回 None
    pub async fn next(&mut self) -> Option<StreamFrame> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 关闭信号（读循环据此退出）
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
