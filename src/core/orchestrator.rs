//! 集成编排器：需求 → 规格 → 任务 → 健康检查 → 落盘 → 监控 → 交接
//!
//! 只有规格生成失败会中止流程；之后的失败都降级为 warnings，已落盘的状态不回滚。
//! 每一步完成后广播一条 PhaseReport。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HandoffSection;
use crate::gateway::AgentApi;
use crate::monitor::{ProgressMonitor, ProjectRecord, TaskRecord, TaskStatus};
use crate::planning::{
    normalize_plan, CreateProjectRequest, PlannedTask, ProjectSpec, SpecGenerator, TaskPlanner,
};
use crate::resilience::{CallContext, ResilientExecutor, RetryConfig};
use crate::store::ProjectStore;

pub const WARN_TASK_BREAKDOWN: &str =
    "task breakdown failed — created project without detailed tasks";
pub const WARN_HANDOFF: &str = "Vamsh communication failed — project created locally only";

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Specification,
    TaskBreakdown,
    HealthCheck,
    Persistence,
    Monitoring,
    Handoff,
    Complete,
}

impl PipelinePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelinePhase::Specification => "specification",
            PipelinePhase::TaskBreakdown => "task_breakdown",
            PipelinePhase::HealthCheck => "health_check",
            PipelinePhase::Persistence => "persistence",
            PipelinePhase::Monitoring => "monitoring",
            PipelinePhase::Handoff => "handoff",
            PipelinePhase::Complete => "complete",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段进度报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub project: String,
    pub phase: PipelinePhase,
    /// 0–100
    pub progress: u8,
    pub message: String,
}

/// create_project 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateProjectOutcome {
    pub success: bool,
    pub project_id: Option<String>,
    /// 成功时为 complete，失败时为出错的阶段
    pub phase: PipelinePhase,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub task_count: usize,
}

impl CreateProjectOutcome {
    fn failed(phase: PipelinePhase, project_id: Option<String>, error: String, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            project_id,
            phase,
            warnings,
            error: Some(error),
            task_count: 0,
        }
    }
}

/// 交接参数
#[derive(Debug, Clone)]
pub struct HandoffSettings {
    pub ack_timeout: Duration,
    pub ack_poll_interval: Duration,
}

impl From<&HandoffSection> for HandoffSettings {
    fn from(section: &HandoffSection) -> Self {
        Self {
            ack_timeout: Duration::from_secs(section.ack_timeout_secs),
            ack_poll_interval: Duration::from_millis(section.ack_poll_interval_ms.max(10)),
        }
    }
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self::from(&HandoffSection::default())
    }
}

/// 集成编排器
pub struct IntegrationOrchestrator {
    spec_generator: Arc<dyn SpecGenerator>,
    task_planner: Arc<dyn TaskPlanner>,
    agent: Arc<dyn AgentApi>,
    store: Arc<dyn ProjectStore>,
    monitor: ProgressMonitor,
    executor: Arc<ResilientExecutor>,
    handoff: HandoffSettings,
    reports: broadcast::Sender<PhaseReport>,
}

impl IntegrationOrchestrator {
    pub fn new(
        spec_generator: Arc<dyn SpecGenerator>,
        task_planner: Arc<dyn TaskPlanner>,
        agent: Arc<dyn AgentApi>,
        store: Arc<dyn ProjectStore>,
        monitor: ProgressMonitor,
        executor: Arc<ResilientExecutor>,
    ) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            spec_generator,
            task_planner,
            agent,
            store,
            monitor,
            executor,
            handoff: HandoffSettings::default(),
            reports,
        }
    }

    pub fn with_handoff(mut self, handoff: HandoffSettings) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhaseReport> {
        self.reports.subscribe()
    }

    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    /// 运行完整流水线
    pub async fn create_project(&self, request: CreateProjectRequest) -> CreateProjectOutcome {
        let name = request.name.trim().to_string();
        let mut warnings = Vec::new();

        // 1. 规格：失败即中止，不落盘
        self.report(&name, PipelinePhase::Specification, 10, "Generating specification");
        if name.is_empty() {
            return self.abort(&name, PipelinePhase::Specification, None, "project name must not be empty".into(), warnings);
        }
        let spec_context = CallContext::new("llm", "generate_spec");
        let spec = match self
            .executor
            .run(&spec_context, || self.spec_generator.generate_spec(&request))
            .await
        {
            Ok(spec) => spec,
            Err(e) => {
                return self.abort(&name, PipelinePhase::Specification, None, e.to_string(), warnings);
            }
        };

        // 2. 任务拆分：失败降级为零任务
        self.report(&name, PipelinePhase::TaskBreakdown, 25, "Breaking specification into tasks");
        let plan_context = CallContext::new("llm", "plan_tasks");
        let planned = match self
            .executor
            .run(&plan_context, || self.task_planner.plan_tasks(&spec))
            .await
        {
            Ok(tasks) => normalize_plan(tasks),
            Err(e) => {
                warn!(project = %name, error = %e, "Task breakdown failed");
                warnings.push(WARN_TASK_BREAKDOWN.to_string());
                Vec::new()
            }
        };

        // 3. 健康检查：失败则只在本地创建
        self.report(&name, PipelinePhase::HealthCheck, 40, "Checking Vamsh health");
        let reachable = match self
            .executor
            .run(&self.agent_call("health"), || self.agent.health())
            .await
        {
            Ok(report) if report.is_healthy() => true,
            Ok(report) => {
                warnings.push(format!("Vamsh health check failed: status {:?}", report.status));
                false
            }
            Err(e) => {
                warnings.push(format!("Vamsh health check failed: {e}"));
                false
            }
        };

        // 4. 落盘
        self.report(&name, PipelinePhase::Persistence, 55, "Persisting project and tasks");
        let project_id = Uuid::new_v4().to_string();
        let description = if request.description.trim().is_empty() {
            summarize(&spec.document)
        } else {
            request.description.clone()
        };
        let record = ProjectRecord::new(project_id.clone(), name.clone(), description.clone(), planned.len() as u32);
        let tasks = build_task_records(&project_id, &planned);
        if let Err(e) = self.store.save_project(&record).await {
            return self.abort(&name, PipelinePhase::Persistence, None, e.to_string(), warnings);
        }
        if let Err(e) = self.store.save_tasks(&tasks).await {
            return self.abort(&name, PipelinePhase::Persistence, Some(project_id), e.to_string(), warnings);
        }

        // 5. 注册监控
        self.report(&name, PipelinePhase::Monitoring, 70, "Registering project with the monitor");
        if let Err(e) = self
            .monitor
            .start_project_monitoring(&project_id, &name, &description, tasks.len() as u32)
            .await
        {
            return self.abort(&name, PipelinePhase::Monitoring, Some(project_id), e.to_string(), warnings);
        }

        // 6. 交接
        self.report(&name, PipelinePhase::Handoff, 85, "Handing project over to Vamsh");
        if reachable {
            if let Some(warning) = self.hand_off(&project_id, &name, &spec, &planned).await {
                warnings.push(warning);
            }
        } else {
            warnings.push(WARN_HANDOFF.to_string());
        }

        // 7. 完成
        self.report(&name, PipelinePhase::Complete, 100, "Project created");
        info!(project_id = %project_id, tasks = tasks.len(), warnings = warnings.len(), "Project created");
        CreateProjectOutcome {
            success: true,
            project_id: Some(project_id),
            phase: PipelinePhase::Complete,
            warnings,
            error: None,
            task_count: tasks.len(),
        }
    }

    /// 发送交接说明并有限等待确认；返回需要记录的 warning
    async fn hand_off(
        &self,
        project_id: &str,
        name: &str,
        spec: &ProjectSpec,
        planned: &[PlannedTask],
    ) -> Option<String> {
        // 基线只试一次且有上界，取不到时按 0 计
        let once = self.single_attempt();
        let baseline_bound = self.handoff.ack_timeout.max(self.handoff.ack_poll_interval);
        let baseline = match tokio::time::timeout(
            baseline_bound,
            self.executor
                .execute(&self.agent_call("list_messages"), &once, || self.agent.list_messages(name)),
        )
        .await
        {
            Ok(Ok(messages)) => messages.len(),
            _ => 0,
        };

        let brief = render_brief(spec, planned);
        if let Err(e) = self
            .executor
            .run(&self.agent_call("start_project"), || self.agent.start_project(name, &brief))
            .await
        {
            warn!(project_id, error = %e, "Handoff failed");
            return Some(WARN_HANDOFF.to_string());
        }

        if self.wait_for_ack(name, baseline).await {
            if let Err(e) = self.monitor.mark_agent_started(project_id).await {
                warn!(project_id, error = %e, "Failed to mark project active");
            }
            info!(project_id, "Vamsh acknowledged the handoff");
            None
        } else {
            Some(format!(
                "Vamsh did not acknowledge the handoff within {}s",
                self.handoff.ack_timeout.as_secs()
            ))
        }
    }

    /// 在 ack_timeout 内轮询：出现匹配的新 Vamsh 消息，或 Vamsh 报告 active，即视为确认。
    /// 每次查询只试一次，并以截止时间为上界；超时的调用直接放弃
    async fn wait_for_ack(&self, name: &str, baseline: usize) -> bool {
        let deadline = Instant::now() + self.handoff.ack_timeout;
        let once = self.single_attempt();
        loop {
            let messages = tokio::time::timeout_at(
                deadline,
                self.executor
                    .execute(&self.agent_call("list_messages"), &once, || self.agent.list_messages(name)),
            )
            .await;
            if let Ok(Ok(messages)) = messages {
                let acknowledged = messages
                    .iter()
                    .skip(baseline)
                    .any(|m| m.is_from_agent() && ack_pattern().is_match(&m.content));
                if acknowledged {
                    return true;
                }
            }
            let active = tokio::time::timeout_at(
                deadline,
                self.executor
                    .execute(&self.agent_call("is_agent_active"), &once, || self.agent.is_agent_active(name)),
            )
            .await;
            if let Ok(Ok(true)) = active {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.handoff.ack_poll_interval.min(deadline - now)).await;
        }
    }

    fn single_attempt(&self) -> RetryConfig {
        self.executor.default_retry().clone().with_max_attempts(1)
    }

    fn agent_call(&self, operation: &str) -> CallContext {
        CallContext::new(self.monitor.settings().service.clone(), operation)
    }

    fn report(&self, project: &str, phase: PipelinePhase, progress: u8, message: &str) {
        info!(project, phase = %phase, progress, "{}", message);
        let _ = self.reports.send(PhaseReport {
            project: project.to_string(),
            phase,
            progress,
            message: message.to_string(),
        });
    }

    fn abort(
        &self,
        project: &str,
        phase: PipelinePhase,
        project_id: Option<String>,
        error: String,
        warnings: Vec<String>,
    ) -> CreateProjectOutcome {
        warn!(project, phase = %phase, error = %error, "Project pipeline aborted");
        let _ = self.reports.send(PhaseReport {
            project: project.to_string(),
            phase,
            progress: 100,
            message: format!("Failed: {error}"),
        });
        CreateProjectOutcome::failed(phase, project_id, error, warnings)
    }
}

static ACK_RE: OnceLock<Regex> = OnceLock::new();

/// Vamsh 确认接手的措辞
fn ack_pattern() -> &'static Regex {
    ACK_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(ack(nowledged)?|received|got it|on it|starting|started|working on|will (start|begin))\b",
        )
        .unwrap()
    })
}

/// 规格的首个正文段落，作为缺省描述
fn summarize(document: &str) -> String {
    let line = document
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or("");
    line.chars().take(200).collect()
}

/// 规划任务 → 任务记录；依赖名解析为更早任务的 id
pub fn build_task_records(project_id: &str, planned: &[PlannedTask]) -> Vec<TaskRecord> {
    let mut ids_by_name: HashMap<&str, String> = HashMap::new();
    let mut records = Vec::with_capacity(planned.len());

    for (position, task) in planned.iter().enumerate() {
        let id = format!("{project_id}-{:03}", position + 1);
        let dependencies = task
            .dependencies
            .iter()
            .filter_map(|d| ids_by_name.get(d.as_str()).cloned())
            .collect();
        records.push(TaskRecord {
            id: id.clone(),
            project_id: project_id.to_string(),
            position: position as u32,
            name: task.name.clone(),
            description: task.description.clone(),
            task_type: task.task_type,
            priority: task.priority,
            estimated_hours: task.estimated_hours,
            actual_hours: None,
            dependencies,
            status: TaskStatus::Pending,
        });
        ids_by_name.insert(task.name.as_str(), id);
    }
    records
}

/// 交接说明：规格全文 + 任务清单
pub fn render_brief(spec: &ProjectSpec, planned: &[PlannedTask]) -> String {
    let mut brief = format!("# Project: {}\n\n", spec.name);
    if !spec.description.is_empty() {
        brief.push_str(&spec.description);
        brief.push_str("\n\n");
    }
    brief.push_str("## Specification\n\n");
    brief.push_str(&spec.document);
    brief.push_str("\n\n## Tasks\n\n");
    if planned.is_empty() {
        brief.push_str("No detailed task breakdown is available; plan the work from the specification.\n");
    }
    for (i, task) in planned.iter().enumerate() {
        brief.push_str(&format!(
            "{}. [{}/{}] {} (~{}h)",
            i + 1,
            task.task_type,
            task.priority,
            task.name,
            task.estimated_hours
        ));
        if !task.dependencies.is_empty() {
            brief.push_str(&format!(", depends on: {}", task.dependencies.join(", ")));
        }
        brief.push('\n');
        if !task.description.is_empty() {
            brief.push_str(&format!("   {}\n", task.description));
        }
    }
    brief.push_str("\nPlease acknowledge and start working on this project.\n");
    brief
}
