//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按模型名分别排队预设回复；队列为空时回显最后一条 User 消息（"Echo: ..."），保证结果确定。
//! 记录每次请求，便于断言调用次数与所用模型。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError};
use crate::rlm::budget::UsageSummary;
use crate::rlm::history::Role;

/// 一次被记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub message_count: usize,
    pub last_user: String,
}

/// 预设回复：文本或服务错误
#[derive(Debug, Clone)]
enum Scripted {
    Text(String),
    Fail(String),
}

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    usage_per_call: UsageSummary,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为指定模型追加一条预设回复
    pub fn push_response(&self, model: &str, text: impl Into<String>) -> &Self {
        self.queue(model, Scripted::Text(text.into()));
        self
    }

    /// 为指定模型追加一次失败
    pub fn push_failure(&self, model: &str, reason: impl Into<String>) -> &Self {
        self.queue(model, Scripted::Fail(reason.into()));
        self
    }

    /// 每次调用上报的固定用量
    pub fn with_usage(mut self, usage: UsageSummary) -> Self {
        self.usage_per_call = usage;
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn queue(&self, model: &str, item: Scripted) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(model.to_string()).or_default().push_back(item);
        }
    }

    fn next_scripted(&self, model: &str) -> Option<Scripted> {
        self.scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(model).and_then(|q| q.pop_front()))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        if request.signal.is_some_and(|s| s.is_cancelled()) {
            return Err(LlmError::Cancelled);
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "(no input)".to_string());

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                model: request.model.to_string(),
                message_count: request.messages.len(),
                last_user: last_user.clone(),
            });
        }

        match self.next_scripted(request.model) {
            Some(Scripted::Text(text)) => Ok(Completion::new(text, self.usage_per_call)),
            Some(Scripted::Fail(reason)) => Err(LlmError::Request(reason)),
            None => Ok(Completion::new(
                format!("Echo: {}", last_user),
                self.usage_per_call,
            )),
        }
    }
}
