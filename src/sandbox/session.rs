//! 沙箱会话：一次 Orchestrator 调用独占一个
//!
//! 持有引擎实例、预算与用量计数器，并实现脚本可见的桥接函数：
//! semanticQuery / semanticQueryBatch / recursiveAgentCall。
//! 桥接内发生的致命错误（服务失败 / Hook 中止）先以异常形式返回给脚本，
//! 执行结束后再由 `execute` 重新抛出。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::Value;
use uuid::Uuid;

use crate::core::RlmError;
use crate::llm::{Completion, CompletionRequest};
use crate::rlm::budget::{Accountant, Budget, UsageSummary};
use crate::rlm::history::Message;
use crate::rlm::hooks::{SpawnDirective, SpawnRequest};
use crate::rlm::events::RlmEvent;
use crate::rlm::orchestrator::Orchestrator;
use crate::sandbox::engine::{Bridge, BridgeCall, Context, ExecOutcome, ScriptEngine};

/// 会话状态与桥接实现；与引擎分开存放，使执行期间可同时借用
pub(crate) struct SessionCore {
    id: Uuid,
    accountant: Accountant,
    /// 创建本会话的 Orchestrator（子智能体继承其模型、Hook 与引擎工厂）
    agent: Orchestrator,
    /// 当前根模型（可能已被迭代前 Hook 替换），子智能体沿用
    root_model: Mutex<String>,
    fatal: Mutex<Option<RlmError>>,
}

/// 一个隔离执行环境
pub struct Session {
    engine: Box<dyn ScriptEngine>,
    exec_timeout: Duration,
    loaded: bool,
    released: bool,
    core: SessionCore,
}

impl Session {
    /// 由 Orchestrator 创建：预算取自其选项
    pub fn open(engine: Box<dyn ScriptEngine>, agent: Orchestrator) -> Self {
        let options = agent.options();
        let budget = Budget::new(
            options.max_calls,
            options.max_iterations,
            options.depth,
            options.max_depth,
        );
        let exec_timeout = options.exec_timeout;
        let root_model = options.root_model.clone();
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, depth = options.depth, "sandbox session opened");
        Self {
            engine,
            exec_timeout,
            loaded: false,
            released: false,
            core: SessionCore {
                id,
                accountant: Accountant::new(budget),
                agent,
                root_model: Mutex::new(root_model),
                fatal: Mutex::new(None),
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// 加载上下文；每个会话只能加载一次
    pub async fn load(&mut self, context: &Context) -> Result<(), RlmError> {
        if self.loaded {
            return Err(RlmError::ContextAlreadyLoaded);
        }
        self.engine.load(context).await?;
        self.loaded = true;
        tracing::debug!(session = %self.core.id, chars = context.total_chars(), "context loaded");
        Ok(())
    }

    /// 执行一段脚本；脚本错误折叠进 ExecOutcome，Err 只表示致命错误
    pub async fn execute(&mut self, code: &str) -> Result<ExecOutcome, RlmError> {
        let outcome = self
            .engine
            .execute(code, self.exec_timeout, &self.core)
            .await?;
        if let Some(fatal) = self.core.take_fatal() {
            return Err(fatal);
        }
        Ok(outcome)
    }

    /// 读取变量当前值；非法标识符或任何失败都视为 undefined
    pub async fn read_binding(&mut self, name: &str) -> Option<Value> {
        if !is_identifier(name) {
            return None;
        }
        match self.engine.read_binding(name).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(session = %self.core.id, error = %e, "binding lookup failed");
                None
            }
        }
    }

    /// 释放引擎；幂等、尽力而为
    pub async fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.engine.dispose().await;
        tracing::debug!(session = %self.core.id, "sandbox session released");
    }

    /// 根模型调用（编排簿记）：预算不足时直接返回致命的 BudgetExceeded
    pub async fn call_root(&self, model: &str, messages: &[Message]) -> Result<Completion, RlmError> {
        self.core.call_model(model, messages).await
    }

    pub async fn semantic_query(&self, prompt: &str) -> Result<String, RlmError> {
        self.core.semantic_query(prompt).await
    }

    pub async fn semantic_query_batch(&self, prompts: &[String]) -> Result<Vec<String>, RlmError> {
        self.core.semantic_query_batch(prompts).await
    }

    pub async fn recursive_agent_call(
        &self,
        prompt: &str,
        context: Option<Context>,
    ) -> Result<String, RlmError> {
        self.core.recursive_agent_call(prompt, context).await
    }

    /// 记录 Hook 替换后的根模型
    pub fn set_root_model(&self, model: &str) {
        if let Ok(mut current) = self.core.root_model.lock() {
            *current = model.to_string();
        }
    }

    pub fn set_iteration(&self, iteration: u32) {
        self.core.accountant.set_iteration(iteration);
    }

    pub fn budget(&self) -> Budget {
        self.core.accountant.budget()
    }

    pub fn usage(&self) -> UsageSummary {
        self.core.accountant.usage()
    }
}

impl SessionCore {
    async fn call_model(&self, model: &str, messages: &[Message]) -> Result<Completion, RlmError> {
        let count = self.accountant.try_consume_call()?;
        let signal = self.agent.options().signal.as_ref();
        let completion = self
            .agent
            .llm()
            .complete(CompletionRequest::new(model, messages).with_signal(signal))
            .await?;
        self.accountant.add_usage(&completion.usage);
        tracing::debug!(session = %self.id, model = %model, calls = count, "model call");
        Ok(completion)
    }

    async fn semantic_query(&self, prompt: &str) -> Result<String, RlmError> {
        let model = self.agent.options().sub_model.clone();
        let messages = [Message::user(prompt)];
        Ok(self.call_model(&model, &messages).await?.text)
    }

    /// 并发扇出、整体等待；任何一个失败则整体失败，结果保持输入顺序
    async fn semantic_query_batch(&self, prompts: &[String]) -> Result<Vec<String>, RlmError> {
        try_join_all(prompts.iter().map(|p| self.semantic_query(p))).await
    }

    async fn recursive_agent_call(
        &self,
        prompt: &str,
        context: Option<Context>,
    ) -> Result<String, RlmError> {
        let budget = self.accountant.budget();
        if budget.at_recursion_floor() {
            return self.semantic_query(prompt).await;
        }
        if budget.remaining_calls() == 0 {
            return Err(RlmError::BudgetExceeded {
                used: budget.call_count,
                max: budget.max_calls,
            });
        }

        let (mut max_iterations, mut max_calls) = budget.child_limits();
        if let Some(hooks) = self.agent.hooks() {
            let request = SpawnRequest {
                prompt,
                depth: budget.depth + 1,
                max_iterations,
                max_calls,
            };
            match hooks.before_spawn(&request).await {
                SpawnDirective::Continue => {}
                SpawnDirective::Override {
                    max_iterations: iterations,
                    max_calls: calls,
                } => {
                    max_iterations = iterations.unwrap_or(max_iterations);
                    max_calls = calls.unwrap_or(max_calls);
                }
                SpawnDirective::Abort(reason) => return Err(RlmError::HookAbort(reason)),
            }
        }
        // 子会话的调用数最终会合并进本会话，不能超过剩余额度
        let max_calls = max_calls.min(budget.remaining_calls());

        let root_model = self
            .root_model
            .lock()
            .map(|m| m.clone())
            .unwrap_or_else(|_| self.agent.options().root_model.clone());
        let child = self.agent.child(&root_model, max_iterations, max_calls);
        child.emit(RlmEvent::SubAgentSpawned {
            depth: budget.depth + 1,
            max_iterations,
            max_calls,
        });
        tracing::info!(
            session = %self.id,
            depth = budget.depth + 1,
            max_iterations,
            max_calls,
            "spawning sub-agent"
        );

        let context = context.unwrap_or_else(|| Context::Text(prompt.to_string()));
        let run = Box::pin(child.run_accounted(context, prompt)).await;
        self.accountant.merge_child(run.call_count, &run.usage);
        run.result.map(|r| r.text)
    }

    fn record_fatal(&self, err: RlmError) -> String {
        let message = err.to_string();
        if let Ok(mut slot) = self.fatal.lock() {
            slot.get_or_insert(err);
        }
        message
    }

    fn take_fatal(&self) -> Option<RlmError> {
        self.fatal.lock().ok().and_then(|mut slot| slot.take())
    }

    fn to_guest(&self, err: RlmError) -> String {
        if err.is_fatal() {
            self.record_fatal(err)
        } else {
            err.to_string()
        }
    }
}

#[async_trait]
impl Bridge for SessionCore {
    async fn call(&self, call: BridgeCall) -> Result<Value, String> {
        let result = match call {
            BridgeCall::SemanticQuery { prompt } => {
                self.semantic_query(&prompt).await.map(Value::String)
            }
            BridgeCall::SemanticQueryBatch { prompts } => self
                .semantic_query_batch(&prompts)
                .await
                .map(|texts| Value::Array(texts.into_iter().map(Value::String).collect())),
            BridgeCall::RecursiveAgentCall { prompt, context } => self
                .recursive_agent_call(&prompt, context)
                .await
                .map(Value::String),
        };
        result.map_err(|e| self.to_guest(e))
    }
}

/// 仅接受简单标识符，变量读取不做任意表达式求值
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
