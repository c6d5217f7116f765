//! Vamsh HTTP 客户端
//!
//! 固定超时 + 网络类错误的小重试（默认 1 次）；非 2xx 一律按状态码归类为失败。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::AgentSection;
use crate::core::recovery::{classify_reqwest, classify_status};
use crate::core::{ErrorKind, ServiceError};

use super::message::{
    AgentActivity, AgentMessage, AgentState, HealthReport, MessageRequest, MessagesResponse,
    ProjectQuery,
};
use super::{AgentApi, AgentStream};

/// Vamsh HTTP + WebSocket 客户端
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: Client,
    base_url: String,
    ws_url: String,
    timeout: Duration,
    internal_retries: u32,
    internal_retry_delay: Duration,
}

impl AgentClient {
    pub fn new(section: &AgentSection) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(section.request_timeout_secs.max(1));
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vamsh-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServiceError::Validation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            ws_url: section.ws_url.clone(),
            timeout,
            internal_retries: section.internal_retries,
            internal_retry_delay: Duration::from_millis(section.internal_retry_delay_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ServiceError> {
        self.call::<(), R>(Method::GET, path, None).await
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        self.call(Method::POST, path, Some(body)).await
    }

    /// 网络 / 超时错误在网关内部先小重试，其余错误直接交给上层执行器
    async fn call<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, ServiceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retries = 0u32;
        loop {
            match self.call_once(method.clone(), &url, body).await {
                Err(err)
                    if retries < self.internal_retries
                        && matches!(err.kind(), ErrorKind::Network | ErrorKind::Timeout) =>
                {
                    retries += 1;
                    tracing::debug!(%url, retries, "agent request failed, retrying: {}", err);
                    tokio::time::sleep(self.internal_retry_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn call_once<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<R, ServiceError> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| classify_reqwest(&e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| classify_reqwest(&e))?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(ServiceError::from)
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn health(&self) -> Result<HealthReport, ServiceError> {
        self.get("/api/health").await
    }

    async fn status(&self) -> Result<Value, ServiceError> {
        self.get("/api/status").await
    }

    async fn send_message(&self, project_name: &str, message: &str) -> Result<Value, ServiceError> {
        let body = MessageRequest {
            project_name,
            message: Some(message),
            action: None,
        };
        self.post("/api/messages", &body).await
    }

    async fn list_messages(&self, project_name: &str) -> Result<Vec<AgentMessage>, ServiceError> {
        let body = MessageRequest {
            project_name,
            message: None,
            action: Some("get"),
        };
        let response: Option<MessagesResponse> = self.post("/api/messages", &body).await?;
        Ok(response.map(MessagesResponse::into_messages).unwrap_or_default())
    }

    async fn is_agent_active(&self, project_name: &str) -> Result<bool, ServiceError> {
        let activity: AgentActivity = self
            .post("/api/is-agent-active", &ProjectQuery { project_name })
            .await?;
        Ok(activity.active)
    }

    async fn agent_state(&self, project_name: &str) -> Result<AgentState, ServiceError> {
        let state: Option<AgentState> = self
            .post("/api/get-agent-state", &ProjectQuery { project_name })
            .await?;
        Ok(state.unwrap_or_default())
    }

    async fn open_stream(&self, project_name: &str) -> Result<AgentStream, ServiceError> {
        super::stream::connect(&self.ws_url, project_name, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let section = AgentSection {
            base_url: "http://localhost:8000/".to_string(),
            ..AgentSection::default()
        };
        let client = AgentClient::new(&section).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_network_error() {
        // 端口 9 (discard) 在本机通常无人监听
        let section = AgentSection {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout_secs: 2,
            internal_retries: 0,
            ..AgentSection::default()
        };
        let client = AgentClient::new(&section).unwrap();
        let err = client.health().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
        assert!(!client.is_healthy().await);
    }
}
