//! 按配置构建 LLM 客户端；DeepSeek 使用 OpenAI 兼容格式
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话)

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;

use super::{LlmClient, MockLlmClient, OpenAiClient};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 按 [llm] 段创建客户端：provider = deepseek / openai / mock
///
/// 未配置 api_key 时依次读取 `DEEPSEEK_API_KEY`、`OPENAI_API_KEY`；都没有则退回 Mock
pub fn create_llm_client(section: &LlmSection) -> Arc<dyn LlmClient> {
    let timeout = Duration::from_secs(section.timeouts.request.max(1));
    let model = if section.model.is_empty() {
        DEEPSEEK_CHAT
    } else {
        section.model.as_str()
    };

    let provider = section.provider.to_ascii_lowercase();
    let api_key = section.api_key.clone().or_else(|| match provider.as_str() {
        "deepseek" => std::env::var("DEEPSEEK_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok(),
        _ => std::env::var("OPENAI_API_KEY").ok(),
    });

    match (provider.as_str(), api_key) {
        ("mock", _) => Arc::new(MockLlmClient::new()),
        (_, None) => {
            tracing::warn!(provider = %provider, "No API key set, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        ("deepseek", Some(key)) => {
            let base_url = section.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
            tracing::info!("Using DeepSeek LLM ({})", model);
            Arc::new(OpenAiClient::new(Some(base_url), model, Some(&key)).with_timeout(timeout))
        }
        (_, Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", model);
            Arc::new(
                OpenAiClient::new(section.base_url.as_deref(), model, Some(&key))
                    .with_timeout(timeout),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[tokio::test]
    async fn test_mock_provider() {
        let section = LlmSection {
            provider: "mock".to_string(),
            ..LlmSection::default()
        };
        let llm = create_llm_client(&section);
        let reply = llm.complete(&[ChatMessage::user("ping")]).await.unwrap();
        assert_eq!(reply, "Echo from Mock: ping");
    }
}
