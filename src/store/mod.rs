//! 持久化：项目、任务、监控事件
//!
//! ProjectStore 抽象存储后端；默认实现为 sqlx 异步 SQLite。

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::monitor::{MonitoringEvent, ProjectRecord, TaskRecord, TaskStatus};

pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 读出的行无法还原为强类型记录
    #[error("Corrupt record {table}/{id}: {detail}")]
    Corrupt {
        table: &'static str,
        id: String,
        detail: String,
    },
}

/// 异步持久化 trait
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// 按 id 插入或覆盖
    async fn save_project(&self, project: &ProjectRecord) -> Result<(), StoreError>;

    async fn load_project(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError>;

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError>;

    async fn save_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StoreError>;

    /// 按 position 升序
    async fn load_tasks(&self, project_id: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// 返回是否找到该任务
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        actual_hours: Option<f64>,
    ) -> Result<bool, StoreError>;

    /// 追加事件，返回自增 id
    async fn append_event(&self, event: &MonitoringEvent) -> Result<i64, StoreError>;

    /// 在同一事务中写入项目记录并追加事件，返回事件 id
    async fn commit(&self, project: &ProjectRecord, event: &MonitoringEvent) -> Result<i64, StoreError>;

    /// 按时间倒序
    async fn load_events(&self, project_id: &str, limit: u32) -> Result<Vec<MonitoringEvent>, StoreError>;

    async fn close(&self);
}
