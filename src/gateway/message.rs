//! Vamsh HTTP / WebSocket 协议的数据结构
//!
//! 只做结构化映射，不解读 Vamsh 生成的产物；未知字段保留在 extra 中以便原样持久化。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// GET /api/health
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub uptime: Option<f64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "ok" | "healthy" | "running" | "up"
        )
    }
}

/// POST /api/is-agent-active
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    #[serde(default)]
    pub active: bool,
}

/// POST /api/get-agent-state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub completion_percentage: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// /api/messages 中的一条消息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default, alias = "sender", alias = "from")]
    pub role: Option<String>,
    #[serde(default, alias = "message", alias = "text")]
    pub content: String,
    #[serde(default, alias = "created_at")]
    pub timestamp: Option<String>,
}

impl AgentMessage {
    pub fn is_from_agent(&self) -> bool {
        matches!(
            self.role.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("agent" | "assistant" | "vamsh" | "system")
        )
    }
}

/// 请求体：发送消息 / 拉取消息
#[derive(Debug, Clone, Serialize)]
pub struct MessageRequest<'a> {
    pub project_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'a str>,
}

/// 请求体：按项目查询
#[derive(Debug, Clone, Serialize)]
pub struct ProjectQuery<'a> {
    pub project_name: &'a str,
}

/// 拉取消息的响应可能是数组，也可能包在 {messages: [...]} 中
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessagesResponse {
    List(Vec<AgentMessage>),
    Wrapped {
        #[serde(default)]
        messages: Vec<AgentMessage>,
    },
}

impl MessagesResponse {
    pub fn into_messages(self) -> Vec<AgentMessage> {
        match self {
            MessagesResponse::List(list) => list,
            MessagesResponse::Wrapped { messages } => messages,
        }
    }
}

/// 流式通道上的一帧，仅按 type 分派
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    UserMessage(Value),
    ProgressUpdate(Value),
    TaskCompleted(Value),
    Other { kind: String, payload: Value },
}

impl StreamFrame {
    /// 解析一帧 JSON 文本；缺少 type 视为不合法
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_str(text)?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| <serde_json::Error as serde::de::Error>::missing_field("type"))?
            .to_string();
        Ok(Self::from_parts(kind, payload))
    }

    pub fn from_parts(kind: String, payload: Value) -> Self {
        match kind.as_str() {
            "user-message" => StreamFrame::UserMessage(payload),
            "progress-update" => StreamFrame::ProgressUpdate(payload),
            "task-completed" => StreamFrame::TaskCompleted(payload),
            _ => StreamFrame::Other { kind, payload },
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            StreamFrame::UserMessage(_) => "user-message",
            StreamFrame::ProgressUpdate(_) => "progress-update",
            StreamFrame::TaskCompleted(_) => "task-completed",
            StreamFrame::Other { kind, .. } => kind,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            StreamFrame::UserMessage(p)
            | StreamFrame::ProgressUpdate(p)
            | StreamFrame::TaskCompleted(p)
            | StreamFrame::Other { payload: p, .. } => p,
        }
    }
}
