//! ProgressMonitor：项目生命周期、轮询与推送接入
//!
//! 每个被监控的项目有一个轮询任务（可选一个流式任务），二者与 API 调用走同一组入口，
//! 在项目锁内完成「合并 → 记录与事件同一事务落盘 → 广播」。每次变更恰好追加一条事件。
//!
//! 轮询中的网络调用不持有项目锁；停止项目时先在锁内落盘 cancelled，再中止并等待任务退出。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentSection, MonitorSection};
use crate::core::{ProjectStatus, RemoteStatus, ServiceError, SessionSupervisor};
use crate::gateway::{AgentApi, StreamFrame};
use crate::resilience::{CallContext, ResilientExecutor};
use crate::store::{ProjectStore, StoreError};

use super::events::{EventKind, EventPayload, MonitoringEvent, UpdateSource};
use super::types::{
    AgentSnapshot, MergeOutcome, ProgressUpdate, ProjectRecord, TaskRecord, TaskStatus,
};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Project not monitored: {0}")]
    NotFound(String),

    #[error("Invalid transition for project {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ProjectStatus,
        to: ProjectStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 监控参数
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub warning_after_mins: i64,
    pub stuck_after_mins: i64,
    pub enable_streaming: bool,
    pub inactive_means_completed: bool,
    /// 熔断 key 中的服务名
    pub service: String,
}

impl MonitorSettings {
    pub fn from_config(monitor: &MonitorSection, agent: &AgentSection) -> Self {
        Self {
            poll_interval: Duration::from_secs(monitor.poll_interval_secs.max(1)),
            warning_after_mins: monitor.warning_after_mins,
            stuck_after_mins: monitor.stuck_after_mins,
            enable_streaming: monitor.enable_streaming,
            inactive_means_completed: monitor.inactive_means_completed,
            service: agent.service_name.clone(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&MonitorSection::default(), &AgentSection::default())
    }
}

/// 停滞告警等级；每个停滞周期各级只发一次，有进展后复位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum StallLevel {
    Fresh,
    Warned,
    Stuck,
}

struct Tracked {
    record: ProjectRecord,
    /// 已计数的任务 id，重复的 task-completed 不再累加
    completed_tasks: HashSet<String>,
    cancel: Option<CancellationToken>,
    poll: Option<JoinHandle<()>>,
    stream: Option<JoinHandle<()>>,
    stall: StallLevel,
}

impl Tracked {
    fn new(record: ProjectRecord, completed_tasks: HashSet<String>) -> Self {
        Self {
            record,
            completed_tasks,
            cancel: None,
            poll: None,
            stream: None,
            stall: StallLevel::Fresh,
        }
    }

    fn is_running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// 取消令牌并交出任务句柄
    fn halt(&mut self) -> Vec<JoinHandle<()>> {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.poll.take().into_iter().chain(self.stream.take()).collect()
    }
}

/// 一次待提交的变更：新记录 + 对应事件
struct Change {
    record: ProjectRecord,
    payload: EventPayload,
    message: String,
}

/// 来自 API / 轮询 / 推送的进度线索；完成数优先，其次按百分比折算
#[derive(Debug, Clone, Default)]
struct ProgressHint {
    completed: Option<u32>,
    percentage: Option<f64>,
    phase: Option<String>,
    current_task: Option<String>,
}

impl ProgressHint {
    fn from_frame(body: &Value) -> Self {
        Self {
            completed: field_u32(body, &["completed_tasks", "tasks_completed", "completed"]),
            percentage: field_f64(body, &["completion_percentage", "percentage"]),
            phase: field_str(body, &["phase", "current_step"]),
            current_task: field_str(body, &["current_task", "task"]),
        }
    }
}

fn field_u32(v: &Value, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|k| {
        let field = v.get(*k)?;
        field
            .as_u64()
            .or_else(|| field.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|n| n.min(u32::MAX as u64) as u32)
    })
}

fn field_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| v.get(*k).and_then(Value::as_f64))
}

fn field_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Vamsh 百分比按比例折算为完成任务数
pub fn estimate_completed(percentage: f64, total: u32) -> u32 {
    let ratio = percentage.clamp(0.0, 100.0) / 100.0;
    (ratio * total as f64).round() as u32
}

/// 合并进度线索；pending 项目收到任何线索即转为 active。无变化返回 None
fn merged(
    base: &ProjectRecord,
    hint: &ProgressHint,
    now: DateTime<Utc>,
) -> Option<(ProjectRecord, MergeOutcome)> {
    let total = base.progress.tasks_total;
    let completed = hint
        .completed
        .or_else(|| hint.percentage.map(|p| estimate_completed(p, total)))
        .unwrap_or(base.progress.tasks_completed);
    let update = ProgressUpdate {
        phase: hint.phase.clone(),
        current_task: hint.current_task.clone(),
        completed,
        observed_at: now,
    };

    let mut next = base.clone();
    let outcome = next.progress.merge(&update);
    let activated = next.status == ProjectStatus::Pending;
    if !outcome.changed() && !activated {
        return None;
    }
    if activated {
        next.status = ProjectStatus::Active;
    }
    next.refresh_metrics(now);
    Some((next, outcome))
}

fn completion(
    mut next: ProjectRecord,
    trigger: &str,
    last_task: Option<String>,
    now: DateTime<Utc>,
) -> Change {
    next.status = ProjectStatus::Completed;
    next.refresh_metrics(now);
    next.progress.estimated_completion = None;
    let p = &next.progress;
    let message = format!(
        "Project {} completed ({}/{} tasks)",
        next.name, p.tasks_completed, p.tasks_total
    );
    let payload = EventPayload::ProjectCompleted {
        tasks_completed: p.tasks_completed,
        tasks_total: p.tasks_total,
        elapsed_minutes: next.metrics.elapsed_minutes,
        trigger: trigger.to_string(),
        last_task,
    };
    Change {
        record: next,
        payload,
        message,
    }
}

fn activation(from: ProjectStatus, next: ProjectRecord) -> Change {
    let message = format!("Project {} is now active", next.name);
    Change {
        payload: EventPayload::StatusChange {
            from: Some(from),
            to: next.status,
            reason: Some("agent started working".to_string()),
        },
        record: next,
        message,
    }
}

fn progress_change(
    from: ProjectStatus,
    next: ProjectRecord,
    outcome: MergeOutcome,
    source: UpdateSource,
) -> Change {
    if !outcome.changed() {
        return activation(from, next);
    }
    let p = &next.progress;
    let message = format!(
        "Progress {}/{} ({:.0}%) in {}",
        p.tasks_completed, p.tasks_total, p.percentage, p.phase
    );
    let payload = EventPayload::ProgressUpdate {
        phase: p.phase.clone(),
        current_task: p.current_task.clone(),
        tasks_completed: p.tasks_completed,
        tasks_total: p.tasks_total,
        percentage: p.percentage,
        source,
    };
    Change {
        record: next,
        payload,
        message,
    }
}

struct MonitorInner {
    store: Arc<dyn ProjectStore>,
    agent: Arc<dyn AgentApi>,
    executor: Arc<ResilientExecutor>,
    settings: MonitorSettings,
    projects: RwLock<HashMap<String, Arc<Mutex<Tracked>>>>,
    supervisor: SessionSupervisor,
    events: broadcast::Sender<MonitoringEvent>,
}

/// 进度监控器；Clone 共享同一份状态
#[derive(Clone)]
pub struct ProgressMonitor {
    inner: Arc<MonitorInner>,
}

impl ProgressMonitor {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        agent: Arc<dyn AgentApi>,
        executor: Arc<ResilientExecutor>,
        settings: MonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MonitorInner {
                store,
                agent,
                executor,
                settings,
                projects: RwLock::new(HashMap::new()),
                supervisor: SessionSupervisor::new(),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    /// 订阅已追加的监控事件
    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.inner.events.subscribe()
    }

    // ---- 生命周期 ----

    /// 注册项目并开始轮询（可选推送）；已存在的未终止记录沿用存储中的版本
    pub async fn start_project_monitoring(
        &self,
        id: &str,
        name: &str,
        description: &str,
        tasks_total: u32,
    ) -> Result<ProjectRecord, MonitorError> {
        let existing = self.inner.projects.read().await.get(id).cloned();
        if let Some(entry) = existing {
            debug!(project_id = id, "Project already monitored");
            return Ok(entry.lock().await.record.clone());
        }

        let mut record = match self.inner.store.load_project(id).await? {
            Some(stored) if stored.status.is_terminal() => {
                return Err(MonitorError::InvalidTransition {
                    id: id.to_string(),
                    from: stored.status,
                    to: ProjectStatus::Pending,
                })
            }
            Some(stored) => stored,
            None => ProjectRecord::new(id, name, description, tasks_total),
        };
        record.updated_at = Utc::now();

        let completed_tasks = self.completed_task_ids(id).await?;
        let status = record.status;
        let event = self
            .persist(
                &record,
                EventPayload::StatusChange {
                    from: None,
                    to: status,
                    reason: Some("monitoring started".to_string()),
                },
                format!("Monitoring started for project {}", record.name),
            )
            .await?;

        let snapshot = record.clone();
        self.track(record, completed_tasks, status.is_monitored()).await;
        self.publish(event);
        info!(project_id = id, tasks_total = snapshot.progress.tasks_total, "Project monitoring started");
        Ok(snapshot)
    }

    /// 停止监控并标记为 cancelled；返回前轮询与推送任务均已退出
    pub async fn stop_project_monitoring(&self, id: &str) -> Result<ProjectRecord, MonitorError> {
        self.transition(id, ProjectStatus::Cancelled, "monitoring stopped".to_string())
            .await
    }

    pub async fn pause_project_monitoring(&self, id: &str) -> Result<ProjectRecord, MonitorError> {
        self.transition(id, ProjectStatus::Paused, "monitoring paused".to_string())
            .await
    }

    pub async fn resume_project_monitoring(&self, id: &str) -> Result<ProjectRecord, MonitorError> {
        self.transition(id, ProjectStatus::Active, "monitoring resumed".to_string())
            .await
    }

    pub async fn fail_project(&self, id: &str, reason: &str) -> Result<ProjectRecord, MonitorError> {
        self.transition(id, ProjectStatus::Failed, reason.to_string()).await
    }

    /// 重启后恢复：重新跟踪所有未终止的项目，非 paused 的恢复轮询
    pub async fn restore(&self) -> Result<usize, MonitorError> {
        let projects = self.inner.store.list_projects().await?;
        let mut restored = 0;
        for record in projects {
            if record.status.is_terminal() {
                continue;
            }
            let completed_tasks = self.completed_task_ids(&record.id).await?;
            let run = record.status.is_monitored();
            debug!(project_id = %record.id, status = %record.status, "Restoring project");
            self.track(record, completed_tasks, run).await;
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Restored monitored projects");
        }
        Ok(restored)
    }

    /// 停止所有轮询与推送任务；不改变项目状态
    pub async fn shutdown(&self) {
        self.inner.supervisor.cancel();
        let entries: Vec<_> = self.inner.projects.read().await.values().cloned().collect();
        let mut handles = Vec::new();
        for entry in entries {
            handles.extend(entry.lock().await.halt());
        }
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        info!("Progress monitor stopped");
    }

    // ---- 进度入口 ----

    /// 上报完成数（可附带阶段与当前任务）；达到总数即完成
    pub async fn update_project_progress(
        &self,
        id: &str,
        phase: Option<&str>,
        current_task: Option<&str>,
        completed: u32,
    ) -> Result<ProjectRecord, MonitorError> {
        let hint = ProgressHint {
            completed: Some(completed),
            percentage: None,
            phase: phase.map(str::to_string),
            current_task: current_task.map(str::to_string),
        };
        self.apply_progress(id, hint, UpdateSource::Api).await
    }

    /// Vamsh 确认接手：pending 项目转为 active，其他状态不变
    pub async fn mark_agent_started(&self, id: &str) -> Result<ProjectRecord, MonitorError> {
        self.apply_progress(id, ProgressHint::default(), UpdateSource::Api)
            .await
    }

    /// 任务完成：计数加一；同一 task_id 只计一次
    pub async fn on_task_completed(
        &self,
        id: &str,
        task_id: &str,
        task_name: &str,
    ) -> Result<ProjectRecord, MonitorError> {
        let entry = self.entry(id).await?;
        let mut tracked = entry.lock().await;
        if !tracked.record.status.is_monitored() {
            debug!(project_id = id, task_id, status = %tracked.record.status, "Ignoring task completion");
            return Ok(tracked.record.clone());
        }
        if tracked.completed_tasks.contains(task_id) {
            debug!(project_id = id, task_id, "Task already counted");
            return Ok(tracked.record.clone());
        }

        let now = Utc::now();
        let hint = ProgressHint {
            completed: Some(tracked.record.progress.tasks_completed.saturating_add(1)),
            current_task: Some(task_name.to_string()),
            ..ProgressHint::default()
        };
        let Some((next, _)) = merged(&tracked.record, &hint, now) else {
            return Ok(tracked.record.clone());
        };

        if !self
            .inner
            .store
            .update_task_status(task_id, TaskStatus::Completed, None)
            .await?
        {
            debug!(project_id = id, task_id, "Completed task has no stored record");
        }

        let change = if next.progress.is_complete() {
            completion(next, "task", Some(task_name.to_string()), now)
        } else {
            let p = &next.progress;
            let payload = EventPayload::TaskCompleted {
                task_id: task_id.to_string(),
                task_name: task_name.to_string(),
                tasks_completed: p.tasks_completed,
                tasks_total: p.tasks_total,
                percentage: p.percentage,
            };
            let message = format!(
                "Task {} completed ({}/{})",
                task_name, p.tasks_completed, p.tasks_total
            );
            Change {
                record: next,
                payload,
                message,
            }
        };
        let record = self.commit_advance(&mut tracked, change, now).await?;
        tracked.completed_tasks.insert(task_id.to_string());
        Ok(record)
    }

    /// 记录阶段完成
    pub async fn complete_phase(&self, id: &str, phase: &str) -> Result<ProjectRecord, MonitorError> {
        let entry = self.entry(id).await?;
        let mut tracked = entry.lock().await;
        if tracked.record.status.is_terminal() {
            return Ok(tracked.record.clone());
        }
        let now = Utc::now();
        let mut next = tracked.record.clone();
        next.progress.phase = phase.to_string();
        next.progress.last_update = next.progress.last_update.max(now);
        next.refresh_metrics(now);
        let change = Change {
            message: format!("Phase {} completed for project {}", phase, next.name),
            payload: EventPayload::PhaseCompleted {
                phase: phase.to_string(),
            },
            record: next,
        };
        self.commit(&mut tracked, change).await
    }

    /// 处理一帧推送；project_name 不匹配或未知类型的帧被忽略
    pub async fn ingest_frame(&self, id: &str, frame: StreamFrame) -> Result<(), MonitorError> {
        let entry = self.entry(id).await?;
        let name = entry.lock().await.record.name.clone();

        let payload = frame.payload();
        let body = payload
            .get("data")
            .filter(|d| d.is_object())
            .unwrap_or(payload);
        let target = payload
            .get("project_name")
            .or_else(|| body.get("project_name"))
            .and_then(Value::as_str);
        if target.is_some_and(|t| t != name) {
            debug!(project_id = id, frame_project = target, "Ignoring frame for another project");
            return Ok(());
        }

        match &frame {
            StreamFrame::ProgressUpdate(_) => {
                self.apply_progress(id, ProgressHint::from_frame(body), UpdateSource::Stream)
                    .await?;
            }
            StreamFrame::TaskCompleted(_) => {
                let task_name = field_str(body, &["task_name", "name"]);
                let task_id = field_str(body, &["task_id", "id"]).or_else(|| task_name.clone());
                match task_id {
                    Some(task_id) => {
                        let task_name = task_name.unwrap_or_else(|| task_id.clone());
                        self.on_task_completed(id, &task_id, &task_name).await?;
                    }
                    None => debug!(project_id = id, "task-completed frame without task id"),
                }
            }
            other => debug!(project_id = id, kind = other.kind(), "Ignoring stream frame"),
        }
        Ok(())
    }

    /// 轮询一次：查询 Vamsh 活跃状态、状态与消息，然后合并；网络失败记为 error 事件
    pub async fn poll_once(&self, id: &str) -> Result<(), MonitorError> {
        let entry = self.entry(id).await?;
        let name = {
            let tracked = entry.lock().await;
            if !tracked.record.status.is_monitored() {
                return Ok(());
            }
            tracked.record.name.clone()
        };

        let agent = &self.inner.agent;
        let executor = &self.inner.executor;

        let active = match executor
            .run(&self.call("is_agent_active", id), || agent.is_agent_active(&name))
            .await
        {
            Ok(active) => active,
            Err(err) => {
                warn!(project_id = id, error = %err, "Poll failed");
                return self.record_poll_failure(&entry, "is_agent_active", &err).await;
            }
        };

        let state = if active {
            match executor
                .run(&self.call("agent_state", id), || agent.agent_state(&name))
                .await
            {
                Ok(state) => Some(state),
                Err(err) => {
                    debug!(project_id = id, error = %err, "Agent state unavailable");
                    None
                }
            }
        } else {
            None
        };

        let messages = match executor
            .run(&self.call("list_messages", id), || agent.list_messages(&name))
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                debug!(project_id = id, error = %err, "Agent messages unavailable");
                Vec::new()
            }
        };

        let now = Utc::now();
        let snapshot = AgentSnapshot {
            active,
            state,
            message_count: messages.len(),
            last_message: messages.last().map(|m| m.content.clone()),
            observed_at: Some(now),
        };

        if !self.apply_poll(&entry, snapshot, now).await? {
            self.stall_check(&entry, now).await?;
        }
        Ok(())
    }

    /// 以指定时间做停滞检查；返回发出的事件类型
    pub async fn check_stall_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EventKind>, MonitorError> {
        let entry = self.entry(id).await?;
        self.stall_check(&entry, now).await
    }

    // ---- 查询 ----

    pub async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>, MonitorError> {
        let entry = self.inner.projects.read().await.get(id).cloned();
        if let Some(entry) = entry {
            return Ok(Some(entry.lock().await.record.clone()));
        }
        Ok(self.inner.store.load_project(id).await?)
    }

    /// 存储中的全部项目，内存中跟踪的以内存版本为准
    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>, MonitorError> {
        let mut projects = self.inner.store.list_projects().await?;
        let tracked = self.inner.projects.read().await.clone();
        for record in projects.iter_mut() {
            if let Some(entry) = tracked.get(&record.id) {
                *record = entry.lock().await.record.clone();
            }
        }
        Ok(projects)
    }

    /// 最近的事件，按时间倒序
    pub async fn project_events(
        &self,
        id: &str,
        limit: u32,
    ) -> Result<Vec<MonitoringEvent>, MonitorError> {
        Ok(self.inner.store.load_events(id, limit).await?)
    }

    pub async fn project_tasks(&self, id: &str) -> Result<Vec<TaskRecord>, MonitorError> {
        Ok(self.inner.store.load_tasks(id).await?)
    }

    /// 轮询任务是否仍在运行
    pub async fn is_polling(&self, id: &str) -> bool {
        let entry = self.inner.projects.read().await.get(id).cloned();
        match entry {
            Some(entry) => entry.lock().await.is_running(),
            None => false,
        }
    }

    // ---- 内部 ----

    fn call(&self, operation: &str, project_id: &str) -> CallContext {
        CallContext::new(self.inner.settings.service.clone(), operation).for_project(project_id)
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<Tracked>>, MonitorError> {
        self.inner
            .projects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(id.to_string()))
    }

    async fn completed_task_ids(&self, id: &str) -> Result<HashSet<String>, MonitorError> {
        Ok(self
            .inner
            .store
            .load_tasks(id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect())
    }

    async fn track(
        &self,
        record: ProjectRecord,
        completed_tasks: HashSet<String>,
        run: bool,
    ) -> Arc<Mutex<Tracked>> {
        let id = record.id.clone();
        let entry = {
            let mut projects = self.inner.projects.write().await;
            projects
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(Tracked::new(record, completed_tasks))))
                .clone()
        };
        if run {
            let mut tracked = entry.lock().await;
            if !tracked.is_running() {
                self.launch(&mut tracked);
            }
        }
        entry
    }

    fn launch(&self, tracked: &mut Tracked) {
        let token = self.inner.supervisor.child_token();
        let id = tracked.record.id.clone();
        tracked.poll = Some(self.spawn_poll(id.clone(), token.clone()));
        if self.inner.settings.enable_streaming {
            tracked.stream = Some(self.spawn_stream(id, tracked.record.name.clone(), token.clone()));
        }
        tracked.cancel = Some(token);
    }

    fn spawn_poll(&self, id: String, token: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        let period = self.inner.settings.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.poll_once(&id).await {
                            warn!(project_id = %id, error = %e, "Poll tick failed");
                        }
                    }
                }
            }
            debug!(project_id = %id, "Poll loop stopped");
        })
    }

    fn spawn_stream(&self, id: String, name: String, token: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let agent = monitor.inner.agent.clone();
            let context = monitor.call("open_stream", &id);
            let opened = tokio::select! {
                _ = token.cancelled() => return,
                opened = monitor.inner.executor.run(&context, || agent.open_stream(&name)) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(project_id = %id, error = %e, "Stream unavailable, relying on polling");
                    return;
                }
            };
            info!(project_id = %id, "Stream connected");

            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let Some(frame) = frame else {
                    debug!(project_id = %id, "Stream closed by peer");
                    break;
                };
                if let Err(e) = monitor.ingest_frame(&id, frame).await {
                    warn!(project_id = %id, error = %e, "Failed to apply stream frame");
                }
            }
            stream.close();
        })
    }

    async fn apply_progress(
        &self,
        id: &str,
        hint: ProgressHint,
        source: UpdateSource,
    ) -> Result<ProjectRecord, MonitorError> {
        let entry = self.entry(id).await?;
        let mut tracked = entry.lock().await;
        if !tracked.record.status.is_monitored() {
            debug!(project_id = id, status = %tracked.record.status, "Ignoring progress for inactive project");
            return Ok(tracked.record.clone());
        }

        let now = Utc::now();
        let Some((next, outcome)) = merged(&tracked.record, &hint, now) else {
            debug!(project_id = id, ?source, "Progress unchanged or stale");
            return Ok(tracked.record.clone());
        };
        let change = if next.progress.is_complete() {
            completion(next, "progress", None, now)
        } else {
            progress_change(tracked.record.status, next, outcome, source)
        };
        self.commit_advance(&mut tracked, change, now).await
    }

    /// 合并一次轮询结果；返回是否提交了变更
    async fn apply_poll(
        &self,
        entry: &Mutex<Tracked>,
        snapshot: AgentSnapshot,
        now: DateTime<Utc>,
    ) -> Result<bool, MonitorError> {
        let mut tracked = entry.lock().await;
        let status = tracked.record.status;
        if !status.is_monitored() {
            return Ok(true);
        }

        if !snapshot.active {
            if status == ProjectStatus::Active {
                if self.inner.settings.inactive_means_completed {
                    let mut next = tracked.record.clone();
                    next.remote_status = RemoteStatus::Inactive;
                    next.agent = Some(snapshot);
                    next.progress.fast_forward(now);
                    let change = completion(next, "agent_inactive", None, now);
                    self.commit(&mut tracked, change).await?;
                    return Ok(true);
                }
                if tracked.record.remote_status != RemoteStatus::Interrupted {
                    let mut next = tracked.record.clone();
                    next.remote_status = RemoteStatus::Interrupted;
                    next.agent = Some(snapshot);
                    next.updated_at = now;
                    let minutes = next.minutes_since_update(now);
                    let change = Change {
                        message: format!(
                            "Agent went inactive before project {} finished",
                            next.name
                        ),
                        payload: EventPayload::Warning {
                            detail: "agent inactive before all tasks completed".to_string(),
                            minutes_since_update: Some(minutes),
                        },
                        record: next,
                    };
                    self.commit(&mut tracked, change).await?;
                    return Ok(true);
                }
            } else {
                tracked.record.remote_status = RemoteStatus::Inactive;
            }
            tracked.record.agent = Some(snapshot);
            return Ok(false);
        }

        let hint = ProgressHint {
            percentage: snapshot
                .state
                .as_ref()
                .and_then(|s| s.completion_percentage),
            phase: snapshot
                .state
                .as_ref()
                .and_then(|s| s.current_step.clone())
                .filter(|s| !s.is_empty()),
            ..ProgressHint::default()
        };
        let mut base = tracked.record.clone();
        base.remote_status = RemoteStatus::Working;
        base.agent = Some(snapshot);

        match merged(&base, &hint, now) {
            Some((next, outcome)) => {
                let change = if next.progress.is_complete() {
                    completion(next, "progress", None, now)
                } else {
                    progress_change(status, next, outcome, UpdateSource::Poll)
                };
                self.commit_advance(&mut tracked, change, now).await?;
                Ok(true)
            }
            None => {
                tracked.record.remote_status = base.remote_status;
                tracked.record.agent = base.agent;
                Ok(false)
            }
        }
    }

    async fn stall_check(
        &self,
        entry: &Mutex<Tracked>,
        now: DateTime<Utc>,
    ) -> Result<Option<EventKind>, MonitorError> {
        let mut tracked = entry.lock().await;
        if !tracked.record.status.is_monitored() {
            return Ok(None);
        }
        let minutes = tracked.record.minutes_since_update(now);
        let settings = &self.inner.settings;

        let (level, payload, message) =
            if minutes >= settings.stuck_after_mins && tracked.stall < StallLevel::Stuck {
                (
                    StallLevel::Stuck,
                    EventPayload::Error {
                        operation: "progress".to_string(),
                        detail: format!("no progress for {minutes} minutes, project may be stuck"),
                    },
                    format!("Project {} may be stuck", tracked.record.name),
                )
            } else if minutes >= settings.warning_after_mins && tracked.stall < StallLevel::Warned {
                (
                    StallLevel::Warned,
                    EventPayload::Warning {
                        detail: format!("no progress for {minutes} minutes"),
                        minutes_since_update: Some(minutes),
                    },
                    format!("Project {} has not progressed recently", tracked.record.name),
                )
            } else {
                return Ok(None);
            };

        let kind = payload.kind();
        warn!(project_id = %tracked.record.id, minutes, level = ?level, "Project stalled");
        let mut next = tracked.record.clone();
        next.updated_at = now;
        self.commit(
            &mut tracked,
            Change {
                record: next,
                payload,
                message,
            },
        )
        .await?;
        tracked.stall = level;
        Ok(Some(kind))
    }

    async fn record_poll_failure(
        &self,
        entry: &Mutex<Tracked>,
        operation: &str,
        err: &ServiceError,
    ) -> Result<(), MonitorError> {
        let mut tracked = entry.lock().await;
        if !tracked.record.status.is_monitored() {
            return Ok(());
        }
        let mut next = tracked.record.clone();
        next.remote_status = RemoteStatus::Unreachable;
        next.updated_at = Utc::now();
        let change = Change {
            message: format!("Polling {} failed: {}", next.name, err),
            payload: EventPayload::Error {
                operation: operation.to_string(),
                detail: err.to_string(),
            },
            record: next,
        };
        self.commit(&mut tracked, change).await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        to: ProjectStatus,
        reason: String,
    ) -> Result<ProjectRecord, MonitorError> {
        let entry = self.entry(id).await?;
        let (record, handles) = {
            let mut tracked = entry.lock().await;
            let from = tracked.record.status;
            // active 只能由 paused 恢复得到；pending → active 由首个进度触发
            if !from.can_transition_to(to) || (to == ProjectStatus::Active && from != ProjectStatus::Paused) {
                return Err(MonitorError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to,
                });
            }

            let mut next = tracked.record.clone();
            next.status = to;
            next.updated_at = Utc::now();
            let change = Change {
                message: format!("Project {} {} -> {} ({})", next.name, from, to, reason),
                payload: EventPayload::StatusChange {
                    from: Some(from),
                    to,
                    reason: Some(reason),
                },
                record: next,
            };
            let record = self.commit(&mut tracked, change).await?;

            let handles = if to == ProjectStatus::Active {
                self.launch(&mut tracked);
                Vec::new()
            } else {
                tracked.halt()
            };
            (record, handles)
        };

        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        info!(project_id = id, status = %record.status, "Project status changed");
        Ok(record)
    }

    /// 记录与事件在同一事务中落盘；失败时两者都不写入
    async fn persist(
        &self,
        record: &ProjectRecord,
        payload: EventPayload,
        message: String,
    ) -> Result<MonitoringEvent, MonitorError> {
        let mut event = MonitoringEvent::new(record.id.clone(), payload, message);
        event.id = Some(self.inner.store.commit(record, &event).await?);
        Ok(event)
    }

    /// pending 项目被进度直接推进时，先单独提交 pending → active
    async fn commit_advance(
        &self,
        tracked: &mut Tracked,
        change: Change,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, MonitorError> {
        if tracked.record.status == ProjectStatus::Pending
            && change.record.status != ProjectStatus::Pending
            && !matches!(change.payload, EventPayload::StatusChange { .. })
        {
            let mut activated = tracked.record.clone();
            activated.status = ProjectStatus::Active;
            activated.updated_at = now;
            self.commit(tracked, activation(ProjectStatus::Pending, activated))
                .await?;
        }
        self.commit(tracked, change).await
    }

    fn publish(&self, event: MonitoringEvent) {
        let _ = self.inner.events.send(event);
    }

    /// 落盘、追加事件、更新内存、广播；完成时停止该项目的任务
    async fn commit(
        &self,
        tracked: &mut Tracked,
        change: Change,
    ) -> Result<ProjectRecord, MonitorError> {
        let event = self
            .persist(&change.record, change.payload, change.message)
            .await?;
        tracked.record = change.record;
        if !matches!(event.kind(), EventKind::Warning | EventKind::Error) {
            tracked.stall = StallLevel::Fresh;
        }
        if tracked.record.status == ProjectStatus::Completed {
            // 句柄直接丢弃：任务在令牌取消后自行退出
            let _ = tracked.halt();
            info!(project_id = %tracked.record.id, "Project completed");
        }
        self.publish(event);
        Ok(tracked.record.clone())
    }
}
