//! 监控事件：追加写入的审计日志
//!
//! 每种事件类型一个强类型 payload；持久化时按 type + JSON 存储，读取时在存储边界校验。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ProjectStatus;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StatusChange,
    ProgressUpdate,
    TaskCompleted,
    PhaseCompleted,
    Error,
    Warning,
    ProjectCompleted,
}

str_enum!(EventKind {
    StatusChange => "status_change",
    ProgressUpdate => "progress_update",
    TaskCompleted => "task_completed",
    PhaseCompleted => "phase_completed",
    Error => "error",
    Warning => "warning",
    ProjectCompleted => "project_completed",
});

/// 进度来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Api,
    Poll,
    Stream,
}

/// 事件 payload（按 type 区分的强类型变体）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    StatusChange {
        from: Option<ProjectStatus>,
        to: ProjectStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    ProgressUpdate {
        phase: String,
        current_task: Option<String>,
        tasks_completed: u32,
        tasks_total: u32,
        percentage: f64,
        source: UpdateSource,
    },
    TaskCompleted {
        task_id: String,
        task_name: String,
        tasks_completed: u32,
        tasks_total: u32,
        percentage: f64,
    },
    PhaseCompleted {
        phase: String,
    },
    Error {
        operation: String,
        detail: String,
    },
    Warning {
        detail: String,
        #[serde(default)]
        minutes_since_update: Option<i64>,
    },
    ProjectCompleted {
        tasks_completed: u32,
        tasks_total: u32,
        elapsed_minutes: f64,
        /// 触发完成的路径：progress / task / agent_inactive
        trigger: String,
        #[serde(default)]
        last_task: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::StatusChange { .. } => EventKind::StatusChange,
            EventPayload::ProgressUpdate { .. } => EventKind::ProgressUpdate,
            EventPayload::TaskCompleted { .. } => EventKind::TaskCompleted,
            EventPayload::PhaseCompleted { .. } => EventKind::PhaseCompleted,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::Warning { .. } => EventKind::Warning,
            EventPayload::ProjectCompleted { .. } => EventKind::ProjectCompleted,
        }
    }
}

/// 一条监控事件；写入后不再修改或删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringEvent {
    /// 持久化后由数据库分配
    pub id: Option<i64>,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    pub message: String,
}

impl MonitoringEvent {
    pub fn new(project_id: impl Into<String>, payload: EventPayload, message: impl Into<String>) -> Self {
        Self {
            id: None,
            project_id: project_id.into(),
            timestamp: Utc::now(),
            payload,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
