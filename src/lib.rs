//! Vamsh Bridge - 本地项目管理与 Vamsh 开发智能体之间的交接与进度监控
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、项目状态机、服务上下文、集成编排器、优雅关闭
//! - **resilience**: 重试退避、按 (service, operation) 共享的熔断器、执行器事件
//! - **gateway**: Vamsh HTTP / WebSocket 强类型客户端
//! - **monitor**: 项目记录、监控事件、ProgressMonitor（轮询 + 推送 + 停滞检测）
//! - **store**: sqlx 异步 SQLite 持久化
//! - **planning**: 规格生成与任务拆分（LLM）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化

#[macro_use]
mod macros;

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod monitor;
pub mod observability;
pub mod planning;
pub mod resilience;
pub mod store;

pub use crate::core::{BridgeContext, CreateProjectOutcome, IntegrationOrchestrator};
pub use crate::monitor::ProgressMonitor;
pub use crate::resilience::ResilientExecutor;
