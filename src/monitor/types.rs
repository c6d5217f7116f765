//! 项目、任务记录与进度合并
//!
//! 进度只能经 `Progress::merge` 修改：已完成数取最大值、时间戳取最大值，
//! 轮询与推送乱序到达时较旧的低值不会让进度倒退。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ProjectStatus, RemoteStatus};
use crate::gateway::AgentState;

/// 项目进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub current_task: Option<String>,
    pub tasks_completed: u32,
    pub tasks_total: u32,
    pub percentage: f64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// 一次进度上报（来源可以是 API、轮询或推送）
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Option<String>,
    pub current_task: Option<String>,
    pub completed: u32,
    pub observed_at: DateTime<Utc>,
}

/// 合并结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 已完成数增加
    Advanced,
    /// 数量不变，阶段或当前任务变化
    Relabelled,
    Unchanged,
    /// 低于已记录的完成数，被丢弃
    Stale,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Advanced | MergeOutcome::Relabelled)
    }
}

/// total 为 0 时百分比为 0
pub fn percentage(completed: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    }
}

impl Progress {
    pub fn new(tasks_total: u32, now: DateTime<Utc>) -> Self {
        Self {
            phase: "pending".to_string(),
            current_task: None,
            tasks_completed: 0,
            tasks_total,
            percentage: 0.0,
            started_at: now,
            last_update: now,
            estimated_completion: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.tasks_total > 0 && self.tasks_completed >= self.tasks_total
    }

    /// 单调合并：count = max(当前, min(上报, total))，last_update = max(...)
    pub fn merge(&mut self, update: &ProgressUpdate) -> MergeOutcome {
        let incoming = update.completed.min(self.tasks_total);
        if incoming < self.tasks_completed {
            return MergeOutcome::Stale;
        }

        let advanced = incoming > self.tasks_completed;
        let phase_changed = update
            .phase
            .as_deref()
            .is_some_and(|p| !p.is_empty() && p != self.phase);
        let task_changed = update.current_task.is_some() && update.current_task != self.current_task;

        if !advanced && !phase_changed && !task_changed {
            return MergeOutcome::Unchanged;
        }

        self.tasks_completed = incoming;
        if phase_changed {
            if let Some(phase) = &update.phase {
                self.phase = phase.clone();
            }
        }
        if task_changed {
            self.current_task = update.current_task.clone();
        }
        self.percentage = percentage(self.tasks_completed, self.tasks_total);
        self.last_update = self.last_update.max(update.observed_at);

        if advanced {
            MergeOutcome::Advanced
        } else {
            MergeOutcome::Relabelled
        }
    }

    /// 直接把完成数推到 total（用于 Vamsh 报告结束）
    pub fn fast_forward(&mut self, observed_at: DateTime<Utc>) {
        self.tasks_completed = self.tasks_total;
        self.percentage = percentage(self.tasks_completed, self.tasks_total);
        self.last_update = self.last_update.max(observed_at);
    }
}

/// 派生指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetrics {
    pub elapsed_minutes: f64,
    pub average_task_minutes: Option<f64>,
    /// 每小时完成的任务数
    pub efficiency: f64,
}

/// 最近一次轮询看到的 Vamsh 状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub active: bool,
    #[serde(default)]
    pub state: Option<AgentState>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub last_message: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// 项目记录；注册到 ProgressMonitor 后只由 ProgressMonitor 修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub remote_status: RemoteStatus,
    pub progress: Progress,
    pub metrics: ProjectMetrics,
    pub agent: Option<AgentSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        tasks_total: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            status: ProjectStatus::Pending,
            remote_status: RemoteStatus::Unknown,
            progress: Progress::new(tasks_total, now),
            metrics: ProjectMetrics::default(),
            agent: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 重新计算耗时、平均任务时长、效率与预计完成时间
    pub fn refresh_metrics(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.progress.started_at).max(Duration::zero());
        let elapsed_minutes = elapsed.num_milliseconds() as f64 / 60_000.0;
        let done = self.progress.tasks_completed;

        self.metrics.elapsed_minutes = elapsed_minutes;
        if done > 0 {
            let average = elapsed_minutes / done as f64;
            self.metrics.average_task_minutes = Some(average);
            self.metrics.efficiency = if elapsed_minutes > 0.0 {
                done as f64 / (elapsed_minutes / 60.0)
            } else {
                0.0
            };
            let remaining = self.progress.tasks_total.saturating_sub(done);
            self.progress.estimated_completion = if remaining == 0 {
                None
            } else {
                Some(now + Duration::milliseconds((average * remaining as f64 * 60_000.0) as i64))
            };
        } else {
            self.metrics.average_task_minutes = None;
            self.metrics.efficiency = 0.0;
            self.progress.estimated_completion = None;
        }
        self.updated_at = now;
    }

    pub fn minutes_since_update(&self, now: DateTime<Utc>) -> i64 {
        (now - self.progress.last_update).num_minutes()
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Setup,
    Development,
    Testing,
    Documentation,
    Deployment,
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

str_enum!(TaskType {
    Setup => "setup",
    Development => "development",
    Testing => "testing",
    Documentation => "documentation",
    Deployment => "deployment",
});

str_enum!(TaskPriority {
    Low => "low",
    Medium => "medium",
    High => "high",
});

str_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
});

/// 任务记录；由编排器创建一次，之后只随进度更新变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub project_id: String,
    /// 在项目内的顺序，依赖只能指向更小的 position
    pub position: u32,
    pub name: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub estimated_hours: f64,
    pub actual_hours: Option<f64>,
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
}
