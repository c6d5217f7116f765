//! 核心层：错误分类、项目状态机、服务上下文、编排器、关闭处理

pub mod context;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use context::BridgeContext;
pub use error::{ErrorKind, ServiceError};
pub use orchestrator::{
    CreateProjectOutcome, HandoffSettings, IntegrationOrchestrator, PhaseReport, PipelinePhase,
    WARN_HANDOFF, WARN_TASK_BREAKDOWN,
};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{ProjectStatus, RemoteStatus};
