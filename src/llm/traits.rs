//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete（非流式）。

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ServiceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        })
    }
}

/// 单条对话消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid LLM request: {0}")]
    InvalidRequest(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

impl From<LlmError> for ServiceError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Api(msg) => ServiceError::Network(msg),
            LlmError::Timeout(_) => ServiceError::Timeout(err.to_string()),
            LlmError::InvalidRequest(msg) => ServiceError::Validation(msg),
            LlmError::EmptyResponse => ServiceError::Unknown(err.to_string()),
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    #[test]
    fn test_llm_errors_map_to_taxonomy() {
        assert_eq!(ServiceError::from(LlmError::Api("502".into())).kind(), ErrorKind::Network);
        assert_eq!(ServiceError::from(LlmError::Timeout(120)).kind(), ErrorKind::Timeout);
        assert_eq!(
            ServiceError::from(LlmError::InvalidRequest("bad model".into())).kind(),
            ErrorKind::Validation
        );
        assert!(!ServiceError::from(LlmError::InvalidRequest(String::new())).is_retryable());
    }
}
