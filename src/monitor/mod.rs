//! 项目进度监控：记录类型、事件日志、ProgressMonitor

pub mod events;
pub mod progress;
pub mod types;

pub use events::{EventKind, EventPayload, MonitoringEvent, UpdateSource};
pub use progress::{estimate_completed, MonitorError, MonitorSettings, ProgressMonitor};
pub use types::{
    percentage, AgentSnapshot, MergeOutcome, Progress, ProgressUpdate, ProjectMetrics,
    ProjectRecord, TaskPriority, TaskRecord, TaskStatus, TaskType,
};
