//! 文本生成服务抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：一次请求（模型 + 消息历史 + 可选取消信号）
//! 对应一次回复（文本 + 用量）。服务错误对编排循环是致命的。

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::rlm::budget::UsageSummary;
use crate::rlm::history::Message;

/// 文本生成服务错误
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

/// 单次生成请求
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    /// 调用方的取消信号，贯穿每一次生成调用
    pub signal: Option<&'a CancellationToken>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(model: &'a str, messages: &'a [Message]) -> Self {
        Self {
            model,
            messages,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: Option<&'a CancellationToken>) -> Self {
        self.signal = signal;
        self
    }
}

/// 生成结果：文本与本次用量
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub usage: UsageSummary,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: UsageSummary) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError>;
}
