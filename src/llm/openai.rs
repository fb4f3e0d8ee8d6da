//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 模型名由每次请求指定，根模型与子模型共用同一个客户端。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError};
use crate::rlm::budget::UsageSummary;
use crate::rlm::history::{Message, Role};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// OpenAI 兼容客户端：持有 Client 与请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidRequest(e.to_string());
        messages
            .iter()
            .map(|m| {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()
                            .map_err(invalid)?,
                    ),
                })
            })
            .collect()
    }

    async fn send(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        let body = CreateChatCompletionRequestArgs::default()
            .model(request.model)
            .messages(self.to_openai_messages(request.messages)?)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(body))
            .await
            .map_err(|_| LlmError::Request(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| LlmError::Request(e.to_string()))?;

        // 用量先转成 JSON 再统一做数值强转，缺失字段按 0
        let usage = response
            .usage
            .as_ref()
            .and_then(|u| serde_json::to_value(u).ok())
            .map(|v| UsageSummary::from_provider(&v))
            .unwrap_or_default();

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Completion::new(text, usage))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        tracing::debug!(model = %request.model, messages = request.messages.len(), "chat completion");
        match request.signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => Err(LlmError::Cancelled),
                result = self.send(request) => result,
            },
            None => self.send(request).await,
        }
    }
}
