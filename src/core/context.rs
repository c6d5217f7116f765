//! 服务上下文：显式持有所有服务实例
//!
//! 生命周期 create → start → stop → dispose：create 只构建对象，start 恢复监控，
//! stop 停止后台任务，dispose 在 stop 之后关闭存储。

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::AppConfig;
use crate::gateway::{AgentApi, AgentClient};
use crate::llm::{create_llm_client, LlmClient};
use crate::monitor::{MonitorSettings, ProgressMonitor};
use crate::planning::LlmPlanner;
use crate::resilience::ResilientExecutor;
use crate::store::{ProjectStore, SqliteStore};

use super::orchestrator::{HandoffSettings, IntegrationOrchestrator};
use super::shutdown::{MonitorCleanup, ShutdownCoordinator, ShutdownManager, StoreCleanup};

pub struct BridgeContext {
    config: AppConfig,
    store: Arc<dyn ProjectStore>,
    agent: Arc<dyn AgentApi>,
    executor: Arc<ResilientExecutor>,
    monitor: ProgressMonitor,
    orchestrator: Arc<IntegrationOrchestrator>,
    shutdown: Arc<ShutdownManager>,
}

impl BridgeContext {
    /// 按配置构建：SQLite 存储、HTTP/WS 网关、LLM 规划器
    pub async fn create(config: AppConfig) -> anyhow::Result<Self> {
        let db_path = config.app.database_path();
        let store: Arc<dyn ProjectStore> = Arc::new(
            SqliteStore::open(&db_path)
                .await
                .with_context(|| format!("failed to open database {}", db_path.display()))?,
        );
        let agent: Arc<dyn AgentApi> =
            Arc::new(AgentClient::new(&config.agent).context("failed to build Vamsh client")?);
        let llm = create_llm_client(&config.llm);
        Ok(Self::assemble(config, store, agent, llm))
    }

    /// 用给定的存储、网关与 LLM 组装（测试与嵌入场景）
    pub fn assemble(
        config: AppConfig,
        store: Arc<dyn ProjectStore>,
        agent: Arc<dyn AgentApi>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let executor = Arc::new(ResilientExecutor::from_config(&config.circuit, &config.retry));
        let monitor = ProgressMonitor::new(
            store.clone(),
            agent.clone(),
            executor.clone(),
            MonitorSettings::from_config(&config.monitor, &config.agent),
        );
        let planner = Arc::new(LlmPlanner::new(llm));
        let orchestrator = Arc::new(
            IntegrationOrchestrator::new(
                planner.clone(),
                planner,
                agent.clone(),
                store.clone(),
                monitor.clone(),
                executor.clone(),
            )
            .with_handoff(HandoffSettings::from(&config.handoff)),
        );

        Self {
            config,
            store,
            agent,
            executor,
            monitor,
            orchestrator,
            shutdown: Arc::new(ShutdownManager::new()),
        }
    }

    /// 恢复未终止项目的监控，返回恢复数量
    pub async fn start(&self) -> anyhow::Result<usize> {
        let restored = self
            .monitor
            .restore()
            .await
            .context("failed to restore monitored projects")?;
        info!(
            restored,
            app = self.config.app.name.as_deref().unwrap_or("vamsh-bridge"),
            "Bridge started"
        );
        Ok(restored)
    }

    /// 停止所有后台任务；项目状态保持不变
    pub async fn stop(&self) {
        self.monitor.shutdown().await;
    }

    /// 停止并释放资源
    pub async fn dispose(self) {
        let mut coordinator = ShutdownCoordinator::new(self.shutdown.clone()).with_timeout(10);
        coordinator.register(MonitorCleanup::new(self.monitor.clone()));
        coordinator.register(StoreCleanup::new(self.store.clone()));
        coordinator.run_cleanup().await;
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    pub fn agent(&self) -> &Arc<dyn AgentApi> {
        &self.agent
    }

    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.executor
    }

    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &Arc<IntegrationOrchestrator> {
        &self.orchestrator
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }
}
