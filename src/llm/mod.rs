//! LLM 层：决策方客户端抽象与实现（OpenAI 兼容 / 脚本回放）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use std::sync::Arc;

use crate::config::LlmSection;
use crate::core::WorkflowError;

/// 按 [llm] 配置创建决策方客户端
pub fn create_client(llm: &LlmSection) -> Result<Arc<dyn LlmClient>, WorkflowError> {
    match llm.provider.as_str() {
        "mock" => Ok(Arc::new(ScriptedLlmClient::new(llm.mock_responses.clone()))),
        "openai" => {
            let api_key = std::env::var(&llm.api_key_env).ok();
            if api_key.is_none() {
                tracing::warn!(env = %llm.api_key_env, "API key not set, requests will likely fail");
            }
            Ok(Arc::new(OpenAiClient::new(
                llm.base_url.as_deref(),
                &llm.model,
                api_key.as_deref(),
                llm.request_timeout_secs,
            )))
        }
        other => Err(WorkflowError::Config(format!("Unknown llm.provider: {other}"))),
    }
}
