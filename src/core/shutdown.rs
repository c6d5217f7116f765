//! 优雅关闭处理
//!
//! 统一的关闭信号监听和清理逻辑：
//! - 停止所有项目的轮询与推送任务（项目状态保持不变，重启后恢复）
//! - SQLite 连接池正确关闭

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::monitor::ProgressMonitor;
use crate::store::ProjectStore;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（用于取消正在进行的任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有超时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 等待清理完成的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止监控任务
pub struct MonitorCleanup {
    monitor: ProgressMonitor,
}

impl MonitorCleanup {
    pub fn new(monitor: ProgressMonitor) -> Self {
        Self { monitor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MonitorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.monitor.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ProgressMonitor"
    }
}

/// SQLite 清理任务
pub struct StoreCleanup {
    store: Arc<dyn ProjectStore>,
}

impl StoreCleanup {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for StoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::FatalError("store unavailable".into()));
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    struct MockCleanup {
        called: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    struct HangingCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for HangingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Hanging"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_all_tasks_despite_timeout() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(0);

        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        coordinator.register(HangingCleanup);
        coordinator.register(MockCleanup { called: called.clone() });

        coordinator.run_cleanup().await;
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_with_graceful_shutdown_runs_cleanup() {
        let manager = Arc::new(ShutdownManager::new());
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();

        let trigger = manager.clone();
        let app = async move {
            trigger.shutdown(ShutdownReason::UserInitiated);
            std::future::pending::<()>().await;
        };
        run_with_graceful_shutdown(manager, app, || async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await;
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }
}
