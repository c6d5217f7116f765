//! 弹性调用执行器
//!
//! 对任意外部异步调用包一层：调用前查熔断器，失败按类别决定是否指数退避重试，
//! 每次失败计入熔断器与滚动失败历史，并通过 broadcast 发出通知事件。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{CircuitSection, RetrySection};
use crate::core::{ErrorKind, ServiceError};

use super::circuit::{Admission, CircuitKey, CircuitRegistry, CircuitSnapshot, Transition};
use super::events::{ExecutorEvent, Subscription};

/// 单次调用的身份：服务、操作、所属项目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallContext {
    pub service: String,
    pub operation: String,
    pub project_id: Option<String>,
}

impl CallContext {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            project_id: None,
        }
    }

    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn circuit_key(&self) -> CircuitKey {
        CircuitKey::new(self.service.clone(), self.operation.clone())
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// 第 attempt 次失败后的等待：min(initial * factor^(attempt-1), max)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.max(1.0).powi(exp);
        let capped = base_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// 带抖动时在 [50%, 100%] 区间内随机
    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let ratio = 0.5 + (OsRng.next_u32() as f64 / u32::MAX as f64) * 0.5;
        delay.mul_f64(ratio)
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            backoff_factor: section.backoff_factor,
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter: section.jitter,
        }
    }
}

/// 一条失败记录
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub service: String,
    pub operation: String,
    pub project_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// 失败统计（基于滚动窗口）
#[derive(Debug, Clone, Serialize)]
pub struct FailureStats {
    pub total: usize,
    pub by_type: HashMap<ErrorKind, usize>,
    pub recent_errors: Vec<FailureRecord>,
}

const RECENT_ERRORS: usize = 10;

/// 弹性调用执行器；熔断状态按 (service, operation) 在所有项目间共享
pub struct ResilientExecutor {
    circuits: CircuitRegistry,
    default_retry: RetryConfig,
    history: Mutex<VecDeque<FailureRecord>>,
    history_limit: usize,
    events: broadcast::Sender<ExecutorEvent>,
}

impl ResilientExecutor {
    pub fn new(threshold: u32, cooldown: Duration, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            circuits: CircuitRegistry::new(threshold, cooldown),
            default_retry: RetryConfig::default(),
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
            events,
        }
    }

    pub fn from_config(circuit: &CircuitSection, retry: &RetrySection) -> Self {
        Self::new(
            circuit.failure_threshold,
            Duration::from_secs(circuit.cooldown_secs),
            circuit.history_limit,
        )
        .with_default_retry(RetryConfig::from(retry))
    }

    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn default_retry(&self) -> &RetryConfig {
        &self.default_retry
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }

    /// 使用默认重试策略执行
    pub async fn run<T, F, Fut>(&self, context: &CallContext, operation: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let retry = self.default_retry.clone();
        self.execute(context, &retry, operation).await
    }

    /// 执行 operation；熔断打开时不调用，直接返回 CircuitOpen；重试耗尽返回最后一个错误
    pub async fn execute<T, F, Fut>(
        &self,
        context: &CallContext,
        retry: &RetryConfig,
        mut operation: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let key = context.circuit_key();
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut trial = None;
            match self.circuits.admit(&key) {
                Admission::Rejected { retry_in } => {
                    let err = ServiceError::CircuitOpen {
                        service: context.service.clone(),
                        operation: context.operation.clone(),
                        retry_in_ms: retry_in.as_millis() as u64,
                    };
                    tracing::debug!(
                        service = %context.service,
                        operation = %context.operation,
                        "circuit open, call rejected"
                    );
                    self.remember(context, &err, attempt);
                    return Err(err);
                }
                Admission::Trial => {
                    tracing::info!(
                        service = %context.service,
                        operation = %context.operation,
                        "circuit half-open, sending trial call"
                    );
                    trial = Some(TrialGuard::new(&self.circuits, &key));
                }
                Admission::Allowed => {}
            }

            let outcome = operation().await;
            // 走到这里说明调用已结算，下面的记账负责清除试探标记
            if let Some(guard) = trial.as_mut() {
                guard.settle();
            }

            match outcome {
                Ok(value) => {
                    if self.circuits.record_success(&key) == Transition::Closed {
                        tracing::info!(
                            service = %context.service,
                            operation = %context.operation,
                            "circuit closed"
                        );
                        self.emit(ExecutorEvent::CircuitBreakerClosed {
                            service: context.service.clone(),
                            operation: context.operation.clone(),
                        });
                    }
                    if attempt > 1 {
                        tracing::info!(
                            service = %context.service,
                            operation = %context.operation,
                            attempts = attempt,
                            "call recovered after retry"
                        );
                        self.emit(ExecutorEvent::Recovery {
                            context: context.clone(),
                            attempts: attempt,
                        });
                    }
                    return Ok(value);
                }
                Err(err) => {
                    self.remember(context, &err, attempt);
                    tracing::warn!(
                        service = %context.service,
                        operation = %context.operation,
                        project_id = context.project_id.as_deref().unwrap_or("-"),
                        attempt,
                        kind = %err.kind(),
                        "call failed: {}",
                        err
                    );
                    self.emit(ExecutorEvent::Error {
                        context: context.clone(),
                        kind: err.kind(),
                        attempt,
                        message: err.to_string(),
                    });

                    if let Transition::Opened { failures } = self.circuits.record_failure(&key) {
                        tracing::warn!(
                            service = %context.service,
                            operation = %context.operation,
                            failures,
                            "circuit opened"
                        );
                        self.emit(ExecutorEvent::CircuitBreakerOpened {
                            service: context.service.clone(),
                            operation: context.operation.clone(),
                            failures,
                        });
                        // 熔断已打开，后续尝试只会得到 CircuitOpen，直接返回真实错误
                        return Err(err);
                    }

                    if !err.is_retryable() || attempt >= max_attempts {
                        return Err(err);
                    }

                    let delay = retry.delay_for(attempt);
                    self.emit(ExecutorEvent::Retry {
                        context: context.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn statistics(&self) -> FailureStats {
        let history = self.lock_history();
        let mut by_type = HashMap::new();
        for record in history.iter() {
            *by_type.entry(record.kind).or_insert(0) += 1;
        }
        let recent_errors = history
            .iter()
            .rev()
            .take(RECENT_ERRORS)
            .cloned()
            .collect();
        FailureStats {
            total: history.len(),
            by_type,
            recent_errors,
        }
    }

    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.circuits.snapshot()
    }

    fn remember(&self, context: &CallContext, err: &ServiceError, attempt: u32) {
        let mut history = self.lock_history();
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(FailureRecord {
            service: context.service.clone(),
            operation: context.operation.clone(),
            project_id: context.project_id.clone(),
            kind: err.kind(),
            message: err.to_string(),
            attempt,
            at: Utc::now(),
        });
    }

    fn emit(&self, event: ExecutorEvent) {
        // 没有订阅者时 send 返回 Err，忽略即可
        let _ = self.events.send(event);
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<FailureRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 半开试探的占位；调用 future 在结算前被 drop 时归还试探名额
struct TrialGuard<'a> {
    circuits: &'a CircuitRegistry,
    key: &'a CircuitKey,
    settled: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(circuits: &'a CircuitRegistry, key: &'a CircuitKey) -> Self {
        Self {
            circuits,
            key,
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(
                service = %self.key.service,
                operation = %self.key.operation,
                "trial call abandoned, releasing half-open slot"
            );
            self.circuits.release_trial(self.key);
        }
    }
}
