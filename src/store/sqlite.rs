//! 异步 SQLite 持久化（sqlx）
//!
//! projects 表以扁平列存 ProjectRecord；monitoring_events 表自增 id、外键关联项目。
//! 时间统一存为固定精度的 RFC3339 字符串，字典序即时间序。

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::{ProjectStatus, RemoteStatus};
use crate::monitor::{
    AgentSnapshot, EventKind, EventPayload, MonitoringEvent, Progress, ProjectMetrics,
    ProjectRecord, TaskPriority, TaskRecord, TaskStatus, TaskType,
};

use super::{ProjectStore, StoreError};

/// 异步 SQLite 存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                remote_status TEXT NOT NULL,
                phase TEXT NOT NULL,
                current_task TEXT,
                tasks_completed INTEGER NOT NULL DEFAULT 0,
                tasks_total INTEGER NOT NULL DEFAULT 0,
                percentage REAL NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                last_update TEXT NOT NULL,
                estimated_completion TEXT,
                elapsed_minutes REAL NOT NULL DEFAULT 0,
                average_task_minutes REAL,
                efficiency REAL NOT NULL DEFAULT 0,
                agent_state TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                task_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                estimated_hours REAL NOT NULL DEFAULT 0,
                actual_hours REAL,
                dependencies TEXT NOT NULL,
                status TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS monitoring_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL,
                message TEXT NOT NULL,
                FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_project_time ON monitoring_events(project_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(table: &'static str, id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            id: id.to_string(),
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn parse_enum<T: FromStr<Err = String>>(
    table: &'static str,
    id: &str,
    raw: &str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|detail| StoreError::Corrupt {
        table,
        id: id.to_string(),
        detail,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<ProjectRecord, StoreError> {
    let id: String = row.get("id");
    let agent_raw: Option<String> = row.get("agent_state");
    let agent = match agent_raw {
        Some(raw) => Some(serde_json::from_str::<AgentSnapshot>(&raw).map_err(|e| {
            StoreError::Corrupt {
                table: "projects",
                id: id.clone(),
                detail: format!("agent_state: {e}"),
            }
        })?),
        None => None,
    };
    let estimated: Option<String> = row.get("estimated_completion");
    let estimated_completion = match estimated {
        Some(raw) => Some(parse_ts("projects", &id, &raw)?),
        None => None,
    };

    Ok(ProjectRecord {
        name: row.get("name"),
        description: row.get("description"),
        status: parse_enum::<ProjectStatus>("projects", &id, row.get("status"))?,
        remote_status: parse_enum::<RemoteStatus>("projects", &id, row.get("remote_status"))?,
        progress: Progress {
            phase: row.get("phase"),
            current_task: row.get("current_task"),
            tasks_completed: row.get::<i64, _>("tasks_completed").max(0) as u32,
            tasks_total: row.get::<i64, _>("tasks_total").max(0) as u32,
            percentage: row.get("percentage"),
            started_at: parse_ts("projects", &id, row.get("started_at"))?,
            last_update: parse_ts("projects", &id, row.get("last_update"))?,
            estimated_completion,
        },
        metrics: ProjectMetrics {
            elapsed_minutes: row.get("elapsed_minutes"),
            average_task_minutes: row.get("average_task_minutes"),
            efficiency: row.get("efficiency"),
        },
        agent,
        created_at: parse_ts("projects", &id, row.get("created_at"))?,
        updated_at: parse_ts("projects", &id, row.get("updated_at"))?,
        id,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let id: String = row.get("id");
    let deps_raw: String = row.get("dependencies");
    let dependencies: Vec<String> =
        serde_json::from_str(&deps_raw).map_err(|e| StoreError::Corrupt {
            table: "tasks",
            id: id.clone(),
            detail: format!("dependencies: {e}"),
        })?;

    Ok(TaskRecord {
        project_id: row.get("project_id"),
        position: row.get::<i64, _>("position").max(0) as u32,
        name: row.get("name"),
        description: row.get("description"),
        task_type: parse_enum::<TaskType>("tasks", &id, row.get("task_type"))?,
        priority: parse_enum::<TaskPriority>("tasks", &id, row.get("priority"))?,
        estimated_hours: row.get("estimated_hours"),
        actual_hours: row.get("actual_hours"),
        dependencies,
        status: parse_enum::<TaskStatus>("tasks", &id, row.get("status"))?,
        id,
    })
}

/// 在存储边界校验 event_type 与 payload 一致
fn event_from_row(row: &SqliteRow) -> Result<MonitoringEvent, StoreError> {
    let id: i64 = row.get("id");
    let key = id.to_string();
    let kind = parse_enum::<EventKind>("monitoring_events", &key, row.get("event_type"))?;
    let payload_raw: String = row.get("payload");
    let payload: EventPayload =
        serde_json::from_str(&payload_raw).map_err(|e| StoreError::Corrupt {
            table: "monitoring_events",
            id: key.clone(),
            detail: format!("payload: {e}"),
        })?;
    if payload.kind() != kind {
        return Err(StoreError::Corrupt {
            table: "monitoring_events",
            id: key,
            detail: format!("event_type {kind} does not match payload {}", payload.kind()),
        });
    }

    Ok(MonitoringEvent {
        id: Some(id),
        project_id: row.get("project_id"),
        timestamp: parse_ts("monitoring_events", &key, row.get("timestamp"))?,
        payload,
        message: row.get("message"),
    })
}

async fn upsert_project(conn: &mut SqliteConnection, p: &ProjectRecord) -> Result<(), StoreError> {
    let agent_state = p.agent.as_ref().map(serde_json::to_string).transpose()?;

    sqlx::query(
        "INSERT INTO projects (
            id, name, description, status, remote_status, phase, current_task,
            tasks_completed, tasks_total, percentage, started_at, last_update,
            estimated_completion, elapsed_minutes, average_task_minutes, efficiency,
            agent_state, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            status = excluded.status,
            remote_status = excluded.remote_status,
            phase = excluded.phase,
            current_task = excluded.current_task,
            tasks_completed = excluded.tasks_completed,
            tasks_total = excluded.tasks_total,
            percentage = excluded.percentage,
            started_at = excluded.started_at,
            last_update = excluded.last_update,
            estimated_completion = excluded.estimated_completion,
            elapsed_minutes = excluded.elapsed_minutes,
            average_task_minutes = excluded.average_task_minutes,
            efficiency = excluded.efficiency,
            agent_state = excluded.agent_state,
            updated_at = excluded.updated_at",
    )
    .bind(&p.id)
    .bind(&p.name)
    .bind(&p.description)
    .bind(p.status.as_str())
    .bind(p.remote_status.as_str())
    .bind(&p.progress.phase)
    .bind(&p.progress.current_task)
    .bind(p.progress.tasks_completed as i64)
    .bind(p.progress.tasks_total as i64)
    .bind(p.progress.percentage)
    .bind(ts(&p.progress.started_at))
    .bind(ts(&p.progress.last_update))
    .bind(p.progress.estimated_completion.as_ref().map(ts))
    .bind(p.metrics.elapsed_minutes)
    .bind(p.metrics.average_task_minutes)
    .bind(p.metrics.efficiency)
    .bind(agent_state)
    .bind(ts(&p.created_at))
    .bind(ts(&p.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

async fn insert_event(conn: &mut SqliteConnection, event: &MonitoringEvent) -> Result<i64, StoreError> {
    let payload = serde_json::to_string(&event.payload)?;
    let result = sqlx::query(
        "INSERT INTO monitoring_events (project_id, event_type, timestamp, payload, message)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&event.project_id)
    .bind(event.kind().as_str())
    .bind(ts(&event.timestamp))
    .bind(payload)
    .bind(&event.message)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn save_project(&self, p: &ProjectRecord) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_project(&mut *conn, p).await
    }

    async fn load_project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    /// 批量写入（事务）
    async fn save_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            let dependencies = serde_json::to_string(&task.dependencies)?;
            sqlx::query(
                "INSERT OR REPLACE INTO tasks (
                    id, project_id, position, name, description, task_type, priority,
                    estimated_hours, actual_hours, dependencies, status
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&task.id)
            .bind(&task.project_id)
            .bind(task.position as i64)
            .bind(&task.name)
            .bind(&task.description)
            .bind(task.task_type.as_str())
            .bind(task.priority.as_str())
            .bind(task.estimated_hours)
            .bind(task.actual_hours)
            .bind(dependencies)
            .bind(task.status.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_tasks(&self, project_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE project_id = ? ORDER BY position ASC")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        actual_hours: Option<f64>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, actual_hours = COALESCE(?, actual_hours) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(actual_hours)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_event(&self, event: &MonitoringEvent) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut *conn, event).await
    }

    /// 项目记录与事件同一事务提交
    async fn commit(&self, project: &ProjectRecord, event: &MonitoringEvent) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_project(&mut *tx, project).await?;
        let id = insert_event(&mut *tx, event).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn load_events(&self, project_id: &str, limit: u32) -> Result<Vec<MonitoringEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, event_type, timestamp, payload, message
             FROM monitoring_events
             WHERE project_id = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(project_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::AgentState;
    use crate::monitor::UpdateSource;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("test.db")).await.unwrap()
    }

    fn task(project_id: &str, position: u32, deps: Vec<String>) -> TaskRecord {
        TaskRecord {
            id: format!("{project_id}-t{position}"),
            project_id: project_id.to_string(),
            position,
            name: format!("task {position}"),
            description: String::new(),
            task_type: TaskType::Development,
            priority: TaskPriority::High,
            estimated_hours: 2.5,
            actual_hours: None,
            dependencies: deps,
            status: TaskStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_project_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut project = ProjectRecord::new("p1", "Todo app", "A todo app", 4);
        project.status = ProjectStatus::Active;
        project.remote_status = RemoteStatus::Working;
        let mut extra = serde_json::Map::new();
        extra.insert("files".into(), serde_json::json!(["main.rs"]));
        project.agent = Some(AgentSnapshot {
            active: true,
            state: Some(AgentState {
                current_step: Some("coding".into()),
                completion_percentage: Some(25.0),
                extra,
            }),
            message_count: 3,
            last_message: Some("working on it".into()),
            observed_at: Some(Utc::now()),
        });
        project.refresh_metrics(Utc::now());
        store.save_project(&project).await.unwrap();

        let loaded = store.load_project("p1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Todo app");
        assert_eq!(loaded.status, ProjectStatus::Active);
        assert_eq!(loaded.remote_status, RemoteStatus::Working);
        assert_eq!(loaded.progress.tasks_total, 4);
        assert_eq!(loaded.agent, project.agent);
        // 微秒精度存储
        assert_eq!(
            loaded.progress.started_at.timestamp_micros(),
            project.progress.started_at.timestamp_micros()
        );

        project.status = ProjectStatus::Completed;
        store.save_project(&project).await.unwrap();
        let all = store.list_projects().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ProjectStatus::Completed);
        assert!(store.load_project("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tasks_round_trip_and_status_update() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .save_project(&ProjectRecord::new("p1", "demo", "", 2))
            .await
            .unwrap();

        let tasks = vec![task("p1", 1, vec!["p1-t0".into()]), task("p1", 0, vec![])];
        store.save_tasks(&tasks).await.unwrap();

        let loaded = store.load_tasks("p1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].position, 0);
        assert_eq!(loaded[1].dependencies, vec!["p1-t0".to_string()]);

        assert!(store
            .update_task_status("p1-t0", TaskStatus::Completed, Some(1.5))
            .await
            .unwrap());
        assert!(!store
            .update_task_status("nope", TaskStatus::Completed, None)
            .await
            .unwrap());
        let loaded = store.load_tasks("p1").await.unwrap();
        assert_eq!(loaded[0].status, TaskStatus::Completed);
        assert_eq!(loaded[0].actual_hours, Some(1.5));
    }

    #[tokio::test]
    async fn test_events_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .save_project(&ProjectRecord::new("p1", "demo", "", 4))
            .await
            .unwrap();

        for done in 1..=3u32 {
            let mut event = MonitoringEvent::new(
                "p1",
                EventPayload::ProgressUpdate {
                    phase: "development".into(),
                    current_task: None,
                    tasks_completed: done,
                    tasks_total: 4,
                    percentage: done as f64 * 25.0,
                    source: UpdateSource::Poll,
                },
                format!("{done}/4"),
            );
            event.timestamp = Utc::now() + chrono::Duration::seconds(done as i64);
            let id = store.append_event(&event).await.unwrap();
            assert!(id > 0);
        }

        let events = store.load_events("p1", 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "3/4");
        assert_eq!(events[2].message, "1/4");
        assert!(events[0].id.is_some());

        let limited = store.load_events("p1", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_event_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .save_project(&ProjectRecord::new("p1", "demo", "", 0))
            .await
            .unwrap();

        let payload = serde_json::to_string(&EventPayload::PhaseCompleted {
            phase: "setup".into(),
        })
        .unwrap();
        sqlx::query(
            "INSERT INTO monitoring_events (project_id, event_type, timestamp, payload, message)
             VALUES ('p1', 'warning', ?, ?, 'tampered')",
        )
        .bind(ts(&Utc::now()))
        .bind(payload)
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.load_events("p1", 10).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    fn phase_event(project_id: &str) -> MonitoringEvent {
        MonitoringEvent::new(
            project_id,
            EventPayload::PhaseCompleted {
                phase: "setup".into(),
            },
            "setup done",
        )
    }

    #[tokio::test]
    async fn test_commit_writes_record_and_event() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut project = ProjectRecord::new("p1", "demo", "", 2);
        project.status = ProjectStatus::Active;
        let id = store.commit(&project, &phase_event("p1")).await.unwrap();
        assert!(id > 0);

        let loaded = store.load_project("p1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ProjectStatus::Active);
        let events = store.load_events("p1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, Some(id));
    }

    #[tokio::test]
    async fn test_commit_rolls_back_record_when_event_fails() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .save_project(&ProjectRecord::new("p1", "demo", "", 2))
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_events BEFORE INSERT ON monitoring_events
             BEGIN SELECT RAISE(ABORT, 'events rejected'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let mut next = ProjectRecord::new("p1", "demo", "", 2);
        next.status = ProjectStatus::Active;
        let err = store.commit(&next, &phase_event("p1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        let loaded = store.load_project("p1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ProjectStatus::Pending);
        assert!(store.load_events("p1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_reports_unusable_directory() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = SqliteStore::open(blocker.join("nested").join("bridge.db")).await;
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
