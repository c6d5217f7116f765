//! 熔断器
//!
//! 以 (service, operation) 为键，所有项目共享；状态只存在于进程生命周期内。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub service: String,
    pub operation: String,
}

impl CircuitKey {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
        }
    }
}

/// 单个键的熔断状态
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    /// 半开状态下是否已有试探调用在途
    trial_in_flight: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// 放行检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// 冷却结束，本次调用作为唯一的试探
    Trial,
    Rejected { retry_in: Duration },
}

/// 失败记账后的状态变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Opened { failures: u32 },
    Closed,
}

/// 快照（供 statistics / UI 展示）
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub operation: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub cooldown_ms: u64,
}

/// 所有熔断器的注册表
#[derive(Debug)]
pub struct CircuitRegistry {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<CircuitKey, CircuitState>>,
}

impl CircuitRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// 调用前检查：open 且冷却未结束直接拒绝；冷却结束转 half-open，只放行一个试探
    pub fn admit(&self, key: &CircuitKey) -> Admission {
        let mut states = self.lock();
        let state = states.entry(key.clone()).or_default();
        match state.status {
            CircuitStatus::Closed => Admission::Allowed,
            CircuitStatus::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_in: self.cooldown - elapsed,
                    }
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    state.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    pub fn record_success(&self, key: &CircuitKey) -> Transition {
        let mut states = self.lock();
        let state = states.entry(key.clone()).or_default();
        let was_half_open = state.status != CircuitStatus::Closed;
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
        if was_half_open {
            Transition::Closed
        } else {
            Transition::None
        }
    }

    pub fn record_failure(&self, key: &CircuitKey) -> Transition {
        let mut states = self.lock();
        let state = states.entry(key.clone()).or_default();
        let now = Instant::now();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(now);
        state.trial_in_flight = false;

        match state.status {
            // 试探失败：重新打开，冷却重新计时
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                Transition::Opened {
                    failures: state.consecutive_failures,
                }
            }
            CircuitStatus::Closed if state.consecutive_failures >= self.threshold => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                Transition::Opened {
                    failures: state.consecutive_failures,
                }
            }
            _ => Transition::None,
        }
    }

    /// 试探调用未结算就被放弃（future 被 drop）时归还试探名额，保持 half-open
    pub fn release_trial(&self, key: &CircuitKey) {
        let mut states = self.lock();
        if let Some(state) = states.get_mut(key) {
            if state.status == CircuitStatus::HalfOpen {
                state.trial_in_flight = false;
            }
        }
    }

    pub fn state(&self, key: &CircuitKey) -> CircuitState {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .lock()
            .iter()
            .map(|(key, state)| CircuitSnapshot {
                service: key.service.clone(),
                operation: key.operation.clone(),
                status: state.status,
                consecutive_failures: state.consecutive_failures,
                threshold: self.threshold,
                cooldown_ms: self.cooldown.as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| (&a.service, &a.operation).cmp(&(&b.service, &b.operation)));
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CircuitKey, CircuitState>> {
        // 临界区内无 panic 路径，中毒时沿用内部数据
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}
