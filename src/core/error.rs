//! 外部服务调用错误分类
//!
//! 与 ResilientExecutor 配合：根据 ErrorKind 决定是否重试、是否计入熔断器。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 调用外部服务（Vamsh、LLM）可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// 连接被拒绝 / 重置 / DNS 失败
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// 请求或响应不合法，重试无意义
    #[error("Validation error: {0}")]
    Validation(String),

    /// 熔断器打开时由执行器合成，不会触达下游
    #[error("Circuit open for {service}/{operation}, retry in {retry_in_ms}ms")]
    CircuitOpen {
        service: String,
        operation: String,
        retry_in_ms: u64,
    },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Network(_) => ErrorKind::Network,
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ServiceError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Unknown 保守地视为可重试
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Validation(format!("invalid JSON: {err}"))
    }
}

/// 错误类别（统计与事件中使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    CircuitOpen,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
