//! LlmPlanner：用 LLM 生成规格文档与任务拆分
//!
//! 规格为 Markdown 原文；任务拆分要求模型输出 JSON 数组，parse_task_list 从回复中提取并宽松解析。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use async_trait::async_trait;

use crate::core::ServiceError;
use crate::llm::{ChatMessage, LlmClient};
use crate::monitor::{TaskPriority, TaskType};

use super::{normalize_plan, CreateProjectRequest, PlannedTask, ProjectSpec, SpecGenerator, TaskPlanner};

const SPEC_SYSTEM_PROMPT: &str = "You are a senior software architect. \
Write a concise technical specification in Markdown for the project described by the user. \
Include: overview, functional requirements, architecture, data model, and acceptance criteria.";

const TASKS_SYSTEM_PROMPT: &str = "You are a technical project planner. \
Break the given specification into implementation tasks. \
Respond with a JSON array only. Each element has the fields: \
name (string), description (string), type (setup|development|testing|documentation|deployment), \
priority (low|medium|high), estimated_hours (number), dependencies (array of earlier task names).";

/// 基于 LLM 的规划器
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SpecGenerator for LlmPlanner {
    async fn generate_spec(&self, request: &CreateProjectRequest) -> Result<ProjectSpec, ServiceError> {
        if request.requirements.trim().is_empty() {
            return Err(ServiceError::Validation("requirements must not be empty".into()));
        }
        let mut prompt = format!("Project name: {}\n", request.name);
        if !request.description.trim().is_empty() {
            prompt.push_str(&format!("Description: {}\n", request.description));
        }
        prompt.push_str(&format!("\nRequirements:\n{}", request.requirements));

        let messages = [ChatMessage::system(SPEC_SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let document = self.llm.complete(&messages).await?;
        info!(project = %request.name, chars = document.len(), "Specification generated");

        Ok(ProjectSpec {
            name: request.name.clone(),
            description: request.description.clone(),
            document: document.trim().to_string(),
        })
    }
}

#[async_trait]
impl TaskPlanner for LlmPlanner {
    async fn plan_tasks(&self, spec: &ProjectSpec) -> Result<Vec<PlannedTask>, ServiceError> {
        let prompt = format!(
            "Project: {}\n\nSpecification:\n{}",
            spec.name, spec.document
        );
        let messages = [ChatMessage::system(TASKS_SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let output = self.llm.complete(&messages).await?;
        let tasks = parse_task_list(&output)?;
        let (_, _, total_tokens) = self.llm.token_usage();
        info!(project = %spec.name, tasks = tasks.len(), total_tokens, "Task breakdown generated");
        Ok(tasks)
    }
}

#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(alias = "title")]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type", alias = "task_type")]
    kind: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, alias = "hours", alias = "estimate")]
    estimated_hours: Option<f64>,
    #[serde(default, alias = "depends_on")]
    dependencies: Vec<String>,
}

fn task_type_of(raw: Option<&str>) -> TaskType {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("setup" | "configuration" | "config") => TaskType::Setup,
        Some("testing" | "test" | "tests") => TaskType::Testing,
        Some("documentation" | "docs" | "doc") => TaskType::Documentation,
        Some("deployment" | "deploy" | "release") => TaskType::Deployment,
        _ => TaskType::Development,
    }
}

fn priority_of(raw: Option<&str>) -> TaskPriority {
    raw.and_then(|s| s.trim().to_ascii_lowercase().parse().ok())
        .unwrap_or_default()
}

/// 从 LLM 回复中提取 JSON 数组（```json 代码块、{"tasks": [...]} 或裸数组）并整理
pub fn parse_task_list(output: &str) -> Result<Vec<PlannedTask>, ServiceError> {
    let trimmed = output.trim();
    let body = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        trimmed
    };

    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => {
            let start = body.find('[');
            let end = body.rfind(']');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&body[s..=e])?,
                _ => {
                    return Err(ServiceError::Validation(
                        "task breakdown is not a JSON array".into(),
                    ))
                }
            }
        }
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("tasks") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ServiceError::Validation(
                    "task breakdown object has no tasks array".into(),
                ))
            }
        },
        _ => {
            return Err(ServiceError::Validation(
                "task breakdown is not a JSON array".into(),
            ))
        }
    };

    let mut tasks = Vec::with_capacity(items.len());
    for item in items {
        let raw: RawTask = serde_json::from_value(item)?;
        tasks.push(PlannedTask {
            name: raw.name,
            description: raw.description,
            task_type: task_type_of(raw.kind.as_deref()),
            priority: priority_of(raw.priority.as_deref()),
            estimated_hours: raw.estimated_hours.unwrap_or(0.0),
            dependencies: raw.dependencies,
        });
    }

    let tasks = normalize_plan(tasks);
    if tasks.is_empty() {
        return Err(ServiceError::Validation("task breakdown is empty".into()));
    }
    debug!(count = tasks.len(), "Parsed task breakdown");
    Ok(tasks)
}
