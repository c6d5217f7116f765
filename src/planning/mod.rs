//! 规划协作者：需求 → 规格文档 → 任务拆分
//!
//! 编排器只依赖 SpecGenerator / TaskPlanner 两个 trait；默认实现是 LlmPlanner。

pub mod llm_planner;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ServiceError;
use crate::monitor::{TaskPriority, TaskType};

pub use llm_planner::{parse_task_list, LlmPlanner};

/// 创建项目的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub requirements: String,
}

impl CreateProjectRequest {
    pub fn new(name: impl Into<String>, requirements: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            requirements: requirements.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 规格文档（Markdown）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub name: String,
    pub description: String,
    pub document: String,
}

/// 规划出的任务；依赖按任务名引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[async_trait]
pub trait SpecGenerator: Send + Sync {
    async fn generate_spec(&self, request: &CreateProjectRequest) -> Result<ProjectSpec, ServiceError>;
}

#[async_trait]
pub trait TaskPlanner: Send + Sync {
    async fn plan_tasks(&self, spec: &ProjectSpec) -> Result<Vec<PlannedTask>, ServiceError>;
}

/// 整理任务列表：去掉空名与重名任务，依赖只保留指向更早任务的引用
pub fn normalize_plan(tasks: Vec<PlannedTask>) -> Vec<PlannedTask> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut normalized = Vec::with_capacity(tasks.len());

    for mut task in tasks {
        task.name = task.name.trim().to_string();
        if task.name.is_empty() || seen.contains(&task.name) {
            continue;
        }
        let mut kept = HashSet::new();
        task.dependencies = task
            .dependencies
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| seen.contains(d) && kept.insert(d.clone()))
            .collect();
        if !task.estimated_hours.is_finite() || task.estimated_hours < 0.0 {
            task.estimated_hours = 0.0;
        }
        seen.insert(task.name.clone());
        normalized.push(task);
    }
    normalized
}
