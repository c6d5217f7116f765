//! 创建流水线端到端测试：内存 Vamsh + Mock LLM + 临时 SQLite

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use vamsh_bridge::config::AppConfig;
use vamsh_bridge::core::{
    BridgeContext, PipelinePhase, ProjectStatus, ServiceError, WARN_HANDOFF, WARN_TASK_BREAKDOWN,
};
use vamsh_bridge::gateway::{AgentApi, AgentMessage, AgentState, AgentStream, HealthReport};
use vamsh_bridge::llm::{LlmError, MockLlmClient};
use vamsh_bridge::monitor::{EventKind, MonitoringEvent, ProjectRecord, TaskRecord, TaskStatus};
use vamsh_bridge::planning::CreateProjectRequest;
use vamsh_bridge::store::{ProjectStore, SqliteStore, StoreError};

const SPEC_DOC: &str = "# Todo\n\nA small todo application with a REST API.\n";

const FOUR_TASKS: &str = r#"```json
{"tasks": [
  {"name": "Project setup", "type": "setup", "priority": "high", "hours": 1},
  {"name": "Data models", "type": "development", "hours": 2, "depends_on": ["Project setup"]},
  {"name": "REST API", "type": "development", "hours": 3, "depends_on": ["Data models"]},
  {"name": "Tests", "type": "testing", "hours": 2, "depends_on": ["REST API"]}
]}
```"#;

/// 内存中的 Vamsh：健康状态可配置，收到交接消息后按需回复确认
#[derive(Default)]
struct FakeVamsh {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    unhealthy: bool,
    unreachable: bool,
    /// 消息与活跃查询一直挂起
    stalled: bool,
    acknowledge: bool,
    messages: Vec<AgentMessage>,
    briefs: Vec<String>,
}

impl FakeVamsh {
    fn healthy() -> Self {
        Self::default()
    }

    fn acknowledging() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().acknowledge = true;
        fake
    }

    fn unhealthy() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().unhealthy = true;
        fake
    }

    fn unreachable() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().unreachable = true;
        fake
    }

    fn stalled() -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().stalled = true;
        fake
    }

    async fn maybe_stall(&self) {
        let stalled = self.state.lock().unwrap().stalled;
        if stalled {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }

    fn briefs(&self) -> Vec<String> {
        self.state.lock().unwrap().briefs.clone()
    }

    fn reachable(&self) -> Result<(), ServiceError> {
        if self.state.lock().unwrap().unreachable {
            Err(ServiceError::Network("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AgentApi for FakeVamsh {
    async fn health(&self) -> Result<HealthReport, ServiceError> {
        self.reachable()?;
        let status = if self.state.lock().unwrap().unhealthy {
            "degraded"
        } else {
            "ok"
        };
        Ok(HealthReport {
            status: status.into(),
            ..HealthReport::default()
        })
    }

    async fn status(&self) -> Result<Value, ServiceError> {
        self.reachable()?;
        Ok(Value::Null)
    }

    async fn send_message(&self, _project: &str, message: &str) -> Result<Value, ServiceError> {
        self.reachable()?;
        let mut state = self.state.lock().unwrap();
        state.briefs.push(message.to_string());
        state.messages.push(AgentMessage {
            role: Some("user".into()),
            content: message.to_string(),
            timestamp: None,
        });
        if state.acknowledge {
            state.messages.push(AgentMessage {
                role: Some("agent".into()),
                content: "Got it, starting on the project setup now.".into(),
                timestamp: None,
            });
        }
        Ok(Value::Null)
    }

    async fn list_messages(&self, _project: &str) -> Result<Vec<AgentMessage>, ServiceError> {
        self.reachable()?;
        self.maybe_stall().await;
        Ok(self.state.lock().unwrap().messages.clone())
    }

    async fn is_agent_active(&self, _project: &str) -> Result<bool, ServiceError> {
        self.reachable()?;
        self.maybe_stall().await;
        Ok(false)
    }

    async fn agent_state(&self, _project: &str) -> Result<AgentState, ServiceError> {
        self.reachable()?;
        Ok(AgentState::default())
    }

    async fn open_stream(&self, _project: &str) -> Result<AgentStream, ServiceError> {
        Err(ServiceError::Network("streaming disabled".into()))
    }
}

/// 可按开关让写入失败的存储，其余操作委托给 SQLite
struct FlakyStore {
    inner: SqliteStore,
    fail_save_project: AtomicBool,
    fail_commit: AtomicBool,
}

impl FlakyStore {
    fn refuse(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProjectStore for FlakyStore {
    async fn save_project(&self, project: &ProjectRecord) -> Result<(), StoreError> {
        Self::refuse(&self.fail_save_project)?;
        self.inner.save_project(project).await
    }

    async fn load_project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        self.inner.load_project(id).await
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        self.inner.list_projects().await
    }

    async fn save_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError> {
        self.inner.save_tasks(tasks).await
    }

    async fn load_tasks(&self, project_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.load_tasks(project_id).await
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        actual_hours: Option<f64>,
    ) -> Result<bool, StoreError> {
        self.inner.update_task_status(task_id, status, actual_hours).await
    }

    async fn append_event(&self, event: &MonitoringEvent) -> Result<i64, StoreError> {
        self.inner.append_event(event).await
    }

    async fn commit(&self, project: &ProjectRecord, event: &MonitoringEvent) -> Result<i64, StoreError> {
        Self::refuse(&self.fail_commit)?;
        self.inner.commit(project, event).await
    }

    async fn load_events(&self, project_id: &str, limit: u32) -> Result<Vec<MonitoringEvent>, StoreError> {
        self.inner.load_events(project_id, limit).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct Bridge {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    ctx: BridgeContext,
}

fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.app.data_dir = dir.path().to_path_buf();
    config.retry.max_attempts = 1;
    config.retry.initial_delay_ms = 1;
    config.retry.jitter = false;
    config.monitor.poll_interval_secs = 3600;
    config.monitor.enable_streaming = false;
    config.handoff.ack_timeout_secs = 0;
    config.handoff.ack_poll_interval_ms = 10;
    config
}

async fn bridge(agent: Arc<FakeVamsh>, llm: MockLlmClient) -> Bridge {
    bridge_with(agent, Arc::new(llm), |_| {}).await
}

async fn bridge_with(
    agent: Arc<FakeVamsh>,
    llm: Arc<MockLlmClient>,
    configure: impl FnOnce(&mut AppConfig),
) -> Bridge {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("bridge.db")).await.unwrap());
    let mut config = test_config(&dir);
    configure(&mut config);

    let ctx = BridgeContext::assemble(config, store.clone(), agent, llm);
    Bridge {
        _dir: dir,
        store,
        ctx,
    }
}

fn todo_request() -> CreateProjectRequest {
    CreateProjectRequest::new("todo", "Users can add, complete and delete todo items.")
}

#[tokio::test]
async fn test_spec_failure_aborts_without_persisting() {
    let b = bridge(Arc::new(FakeVamsh::healthy()), MockLlmClient::new()).await;

    let outcome = b
        .ctx
        .orchestrator()
        .create_project(CreateProjectRequest::new("todo", "   "))
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.phase, PipelinePhase::Specification);
    assert!(outcome.project_id.is_none());
    assert!(outcome.error.is_some());
    assert!(b.store.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_breakdown_failure_creates_project_without_tasks() {
    // 第二次 LLM 调用回显提示词，无法解析为任务列表
    let llm = MockLlmClient::with_replies([SPEC_DOC]);
    let agent = Arc::new(FakeVamsh::acknowledging());
    let b = bridge(agent, llm).await;

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(outcome.success);
    assert_eq!(outcome.phase, PipelinePhase::Complete);
    assert_eq!(outcome.task_count, 0);
    assert!(outcome.warnings.iter().any(|w| w == WARN_TASK_BREAKDOWN));

    let id = outcome.project_id.unwrap();
    let record = b.store.load_project(&id).await.unwrap().unwrap();
    assert_eq!(record.progress.tasks_total, 0);
    assert_eq!(record.description, "A small todo application with a REST API.");
    assert!(b.store.load_tasks(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_full_pipeline_progress_to_completion() {
    let llm = MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]);
    let agent = Arc::new(FakeVamsh::acknowledging());
    let b = bridge(agent.clone(), llm).await;
    let monitor = b.ctx.monitor().clone();

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;
    assert!(outcome.success, "unexpected failure: {:?}", outcome.error);
    assert!(outcome.warnings.is_empty(), "unexpected warnings: {:?}", outcome.warnings);
    assert_eq!(outcome.task_count, 4);

    let id = outcome.project_id.unwrap();
    let briefs = agent.briefs();
    assert_eq!(briefs.len(), 1);
    assert!(briefs[0].contains("REST API"));

    // 确认后项目转为 active
    let record = monitor.get_project(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ProjectStatus::Active);
    assert!(monitor.is_polling(&id).await);

    let tasks = b.store.load_tasks(&id).await.unwrap();
    assert_eq!(tasks.len(), 4);
    assert_eq!(tasks[1].dependencies, vec![tasks[0].id.clone()]);

    monitor.on_task_completed(&id, &tasks[0].id, &tasks[0].name).await.unwrap();
    let record = monitor
        .on_task_completed(&id, &tasks[1].id, &tasks[1].name)
        .await
        .unwrap();
    assert_eq!(record.progress.percentage, 50.0);
    assert_eq!(record.status, ProjectStatus::Active);

    monitor.on_task_completed(&id, &tasks[2].id, &tasks[2].name).await.unwrap();
    let record = monitor
        .on_task_completed(&id, &tasks[3].id, &tasks[3].name)
        .await
        .unwrap();
    assert_eq!(record.progress.percentage, 100.0);
    assert_eq!(record.status, ProjectStatus::Completed);
    assert!(!monitor.is_polling(&id).await);

    let events = monitor.project_events(&id, 100).await.unwrap();
    let completions = events
        .iter()
        .filter(|e| e.kind() == EventKind::ProjectCompleted)
        .count();
    assert_eq!(completions, 1);

    let stored_tasks = b.store.load_tasks(&id).await.unwrap();
    assert!(stored_tasks.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn test_unhealthy_agent_creates_project_locally() {
    let llm = MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]);
    let agent = Arc::new(FakeVamsh::unhealthy());
    let b = bridge(agent.clone(), llm).await;

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(outcome.success);
    assert!(outcome.warnings.iter().any(|w| w == WARN_HANDOFF));
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.starts_with("Vamsh health check failed")));
    assert!(agent.briefs().is_empty());

    let id = outcome.project_id.unwrap();
    let record = b.ctx.monitor().get_project(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ProjectStatus::Pending);
}

#[tokio::test]
async fn test_unreachable_agent_still_persists_and_monitors() {
    let llm = MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]);
    let b = bridge(Arc::new(FakeVamsh::unreachable()), llm).await;

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(outcome.success);
    assert!(outcome.warnings.iter().any(|w| w == WARN_HANDOFF));
    let id = outcome.project_id.unwrap();
    assert!(b.store.load_project(&id).await.unwrap().is_some());
    assert!(b.ctx.monitor().is_polling(&id).await);
}

#[tokio::test]
async fn test_missing_ack_leaves_project_pending() {
    let llm = MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]);
    let agent = Arc::new(FakeVamsh::healthy());
    let b = bridge(agent.clone(), llm).await;

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(outcome.success);
    assert_eq!(agent.briefs().len(), 1);
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.starts_with("Vamsh did not acknowledge the handoff")));
    let id = outcome.project_id.unwrap();
    let record = b.ctx.monitor().get_project(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ProjectStatus::Pending);
}

#[tokio::test]
async fn test_context_restart_restores_monitoring() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("bridge.db");
    let mut config = AppConfig::default();
    config.app.name = Some("restart-check".into());
    config.retry.max_attempts = 1;
    config.monitor.poll_interval_secs = 3600;
    config.monitor.enable_streaming = false;
    config.handoff.ack_timeout_secs = 0;

    let id = {
        let store = Arc::new(SqliteStore::open(&db).await.unwrap());
        let llm = Arc::new(MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]));
        let ctx = BridgeContext::assemble(
            config.clone(),
            store,
            Arc::new(FakeVamsh::acknowledging()),
            llm,
        );
        let outcome = ctx.orchestrator().create_project(todo_request()).await;
        let id = outcome.project_id.unwrap();
        ctx.monitor().update_project_progress(&id, Some("development"), None, 1).await.unwrap();
        ctx.dispose().await;
        id
    };

    let store = Arc::new(SqliteStore::open(&db).await.unwrap());
    let ctx = BridgeContext::assemble(
        config,
        store,
        Arc::new(FakeVamsh::healthy()),
        Arc::new(MockLlmClient::new()),
    );
    assert_eq!(ctx.start().await.unwrap(), 1);
    assert!(ctx.monitor().is_polling(&id).await);

    let record = ctx.monitor().get_project(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ProjectStatus::Active);
    assert_eq!(record.progress.tasks_completed, 1);
    assert_eq!(record.progress.phase, "development");

    ctx.stop().await;
    assert!(!ctx.monitor().is_polling(&id).await);
    ctx.dispose().await;
}

struct FlakyBridge {
    _dir: TempDir,
    store: Arc<FlakyStore>,
    ctx: BridgeContext,
}

async fn flaky_bridge(agent: Arc<FakeVamsh>, llm: MockLlmClient) -> FlakyBridge {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open(dir.path().join("bridge.db")).await.unwrap(),
        fail_save_project: AtomicBool::new(false),
        fail_commit: AtomicBool::new(false),
    });
    let config = test_config(&dir);
    let ctx = BridgeContext::assemble(config, store.clone(), agent, Arc::new(llm));
    FlakyBridge {
        _dir: dir,
        store,
        ctx,
    }
}

#[tokio::test]
async fn test_retryable_spec_failure_aborts_without_persisting() {
    let llm = Arc::new(MockLlmClient::new());
    for _ in 0..3 {
        llm.push_error(LlmError::Api("502 bad gateway".into()));
    }
    let b = bridge_with(Arc::new(FakeVamsh::healthy()), llm.clone(), |c| {
        c.retry.max_attempts = 3;
    })
    .await;

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.phase, PipelinePhase::Specification);
    assert!(outcome.error.unwrap().contains("502"));
    assert_eq!(llm.requests().len(), 3);
    assert!(b.store.list_projects().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_persistence_failure_aborts_pipeline() {
    let llm = MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]);
    let agent = Arc::new(FakeVamsh::acknowledging());
    let b = flaky_bridge(agent.clone(), llm).await;
    b.store.fail_save_project.store(true, Ordering::SeqCst);

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.phase, PipelinePhase::Persistence);
    assert!(outcome.project_id.is_none());
    assert!(outcome.error.unwrap().contains("disk full"));
    assert!(b.store.list_projects().await.unwrap().is_empty());
    assert!(agent.briefs().is_empty());
}

#[tokio::test]
async fn test_monitor_registration_failure_keeps_persisted_project() {
    let llm = MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]);
    let agent = Arc::new(FakeVamsh::acknowledging());
    let b = flaky_bridge(agent.clone(), llm).await;
    b.store.fail_commit.store(true, Ordering::SeqCst);

    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.phase, PipelinePhase::Monitoring);
    let id = outcome.project_id.unwrap();
    // 已落盘的记录与任务不回滚
    assert!(b.store.load_project(&id).await.unwrap().is_some());
    assert_eq!(b.store.load_tasks(&id).await.unwrap().len(), 4);
    assert!(b.store.load_events(&id, 10).await.unwrap().is_empty());
    assert!(!b.ctx.monitor().is_polling(&id).await);
    assert!(agent.briefs().is_empty());
}

#[tokio::test]
async fn test_failed_commit_leaves_monitor_state_untouched() {
    let b = flaky_bridge(Arc::new(FakeVamsh::healthy()), MockLlmClient::new()).await;
    let monitor = b.ctx.monitor();
    monitor.start_project_monitoring("p1", "demo", "", 4).await.unwrap();
    monitor.update_project_progress("p1", None, None, 1).await.unwrap();
    let events_before = monitor.project_events("p1", 100).await.unwrap().len();

    b.store.fail_commit.store(true, Ordering::SeqCst);
    assert!(monitor.update_project_progress("p1", None, None, 2).await.is_err());

    let in_memory = monitor.get_project("p1").await.unwrap().unwrap();
    let stored = b.store.load_project("p1").await.unwrap().unwrap();
    assert_eq!(in_memory.progress.tasks_completed, 1);
    assert_eq!(stored.progress.tasks_completed, 1);
    assert_eq!(monitor.project_events("p1", 100).await.unwrap().len(), events_before);

    // 恢复后同一更新只提交一次
    b.store.fail_commit.store(false, Ordering::SeqCst);
    let record = monitor.update_project_progress("p1", None, None, 2).await.unwrap();
    assert_eq!(record.progress.tasks_completed, 2);
    assert_eq!(
        monitor.project_events("p1", 100).await.unwrap().len(),
        events_before + 1
    );
    monitor.shutdown().await;
}

#[tokio::test]
async fn test_ack_wait_is_bounded_by_timeout() {
    let llm = Arc::new(MockLlmClient::with_replies([SPEC_DOC, FOUR_TASKS]));
    let agent = Arc::new(FakeVamsh::stalled());
    let b = bridge_with(agent.clone(), llm, |c| {
        c.retry.max_attempts = 3;
        c.retry.initial_delay_ms = 300;
    })
    .await;

    let started = Instant::now();
    let outcome = b.ctx.orchestrator().create_project(todo_request()).await;
    let elapsed = started.elapsed();

    assert!(outcome.success);
    assert_eq!(agent.briefs().len(), 1);
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.starts_with("Vamsh did not acknowledge the handoff")));
    assert!(elapsed < Duration::from_secs(2), "ack wait took {elapsed:?}");

    // 被放弃的查询不会让熔断器卡住
    let snapshot = b.ctx.executor().circuit_snapshot();
    assert!(snapshot
        .iter()
        .all(|c| c.consecutive_failures == 0));
}
