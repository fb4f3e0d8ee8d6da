//! 递归编排主循环
//!
//! 加载上下文 -> 调用根模型 -> 解析回复 -> 执行首个代码块 -> 写回有限的执行元数据 ->
//! 检查 FINAL 标记 -> （脚本内）按需递归；任一退出路径都会释放会话。
//!
//! 状态：AwaitingModel -> HaveCode -> AwaitingModel / Done；迭代耗尽后 Exhausted -> Done；
//! 服务错误、Hook 中止、引擎故障 -> Failed。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, Stream};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::RlmError;
use crate::llm::LlmClient;
use crate::rlm::budget::UsageSummary;
use crate::rlm::events::RlmEvent;
use crate::rlm::history::{History, Message};
use crate::rlm::hooks::{IterationDirective, IterationState, RlmHooks};
use crate::rlm::parser::{self, FinalMarker};
use crate::rlm::prompts;
use crate::sandbox::engine::{Context, EngineFactory, ExecOutcome};
use crate::sandbox::node::NodeEngineFactory;
use crate::sandbox::session::Session;

/// 输出超过上限时追加的截断标记
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";
/// 事件中回复 / 输出预览的最大字符数
const EVENT_PREVIEW_CHARS: usize = 300;

/// 一次调用的选项
#[derive(Debug, Clone)]
pub struct RlmOptions {
    /// 驱动循环的根模型
    pub root_model: String,
    /// semanticQuery 使用的子模型
    pub sub_model: String,
    pub max_iterations: u32,
    pub max_calls: u32,
    pub depth: u32,
    pub max_depth: u32,
    /// 单步输出字符上限（超出截断）
    pub max_output_chars: usize,
    /// 写回对话历史的输出预览字符上限
    pub preview_chars: usize,
    /// 单次脚本执行的墙钟预算
    pub exec_timeout: Duration,
    /// 贯穿每次生成调用的取消信号（不会打断正在执行的脚本）
    pub signal: Option<CancellationToken>,
    /// 覆盖内置系统提示词
    pub system_prompt: Option<String>,
}

impl Default for RlmOptions {
    fn default() -> Self {
        Self {
            root_model: "gpt-4o".to_string(),
            sub_model: "gpt-4o-mini".to_string(),
            max_iterations: 20,
            max_calls: 50,
            depth: 0,
            max_depth: 2,
            max_output_chars: 100_000,
            preview_chars: 500,
            exec_timeout: Duration::from_millis(60_000),
            signal: None,
            system_prompt: None,
        }
    }
}

impl RlmOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let rlm = &cfg.rlm;
        Self {
            root_model: cfg.llm.model.clone(),
            sub_model: cfg
                .llm
                .sub_model
                .clone()
                .unwrap_or_else(|| cfg.llm.model.clone()),
            max_iterations: rlm.max_iterations,
            max_calls: rlm.max_calls,
            depth: 0,
            max_depth: rlm.max_depth,
            max_output_chars: rlm.max_output_chars,
            preview_chars: rlm.preview_chars,
            exec_timeout: Duration::from_millis(rlm.exec_timeout_ms),
            signal: None,
            system_prompt: None,
        }
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// 单步记录，创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub iteration: u32,
    /// 回复中去掉代码块后的推理文本
    pub reasoning: String,
    pub code: String,
    /// 截断后的执行输出
    pub output: String,
}

/// 调用结果
#[derive(Debug, Clone, Serialize)]
pub struct RlmResult {
    pub text: String,
    pub steps: Vec<Step>,
    pub call_count: u32,
    pub iterations: u32,
    pub usage: UsageSummary,
}

/// 带最终计数的运行结果；失败的子调用同样要把已消耗的计数合并回父会话
pub(crate) struct AccountedRun {
    pub result: Result<RlmResult, RlmError>,
    pub call_count: u32,
    pub usage: UsageSummary,
}

/// 编排器：廉价可克隆，子智能体通过 `child` 派生
#[derive(Clone)]
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    engines: Arc<dyn EngineFactory>,
    hooks: Option<Arc<dyn RlmHooks>>,
    event_tx: Option<UnboundedSender<RlmEvent>>,
    options: RlmOptions,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, options: RlmOptions) -> Self {
        Self {
            llm,
            engines: Arc::new(NodeEngineFactory::default()),
            hooks: None,
            event_tx: None,
            options,
        }
    }

    /// 设置沙箱引擎工厂
    pub fn with_engine_factory(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = engines;
        self
    }

    /// 设置 Hook
    pub fn with_hooks(mut self, hooks: Arc<dyn RlmHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: UnboundedSender<RlmEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn options(&self) -> &RlmOptions {
        &self.options
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    pub fn hooks(&self) -> Option<&Arc<dyn RlmHooks>> {
        self.hooks.as_ref()
    }

    /// 派生下一层子智能体：继承父会话当前的根模型，以及子模型、Hook、引擎工厂与取消信号
    pub fn child(&self, root_model: &str, max_iterations: u32, max_calls: u32) -> Self {
        let mut child = self.clone();
        child.options.depth += 1;
        child.options.root_model = root_model.to_string();
        child.options.max_iterations = max_iterations;
        child.options.max_calls = max_calls;
        child
    }

    pub(crate) fn emit(&self, event: RlmEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// 对上下文回答查询
    pub async fn generate(
        &self,
        context: impl Into<Context>,
        query: &str,
    ) -> Result<RlmResult, RlmError> {
        self.run_accounted(context.into(), query).await.result
    }

    /// 流式版本：最终答案作为唯一一个分块发出
    pub fn generate_stream(
        &self,
        context: impl Into<Context>,
        query: impl Into<String>,
    ) -> Pin<Box<dyn Stream<Item = Result<String, RlmError>> + Send>> {
        let agent = self.clone();
        let context = context.into();
        let query = query.into();
        Box::pin(stream::once(async move {
            agent.generate(context, &query).await.map(|r| r.text)
        }))
    }

    pub(crate) async fn run_accounted(&self, context: Context, query: &str) -> AccountedRun {
        let engine = match self.engines.create().await {
            Ok(engine) => engine,
            Err(e) => {
                return AccountedRun {
                    result: Err(e),
                    call_count: 0,
                    usage: UsageSummary::default(),
                }
            }
        };
        let mut session = Session::open(engine, self.clone());
        let result = self.drive(&mut session, &context, query).await;
        session.cleanup().await;

        if let Err(e) = &result {
            tracing::warn!(depth = self.options.depth, error = %e, "rlm invocation failed");
        }
        AccountedRun {
            result,
            call_count: session.budget().call_count,
            usage: session.usage(),
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        context: &Context,
        query: &str,
    ) -> Result<RlmResult, RlmError> {
        let opts = &self.options;
        let depth = opts.depth;
        session.load(context).await?;

        let mut history = History::new(prompts::initial_messages(
            context,
            query,
            depth,
            opts.max_depth,
            opts.max_calls,
            opts.max_iterations,
            opts.system_prompt.as_deref(),
        ));
        let mut steps: Vec<Step> = Vec::new();
        let mut model = opts.root_model.clone();
        let mut max_output_chars = opts.max_output_chars;

        tracing::info!(
            depth,
            session = %session.id(),
            max_iterations = opts.max_iterations,
            max_calls = opts.max_calls,
            "rlm invocation started"
        );

        for iteration in 0..opts.max_iterations {
            session.set_iteration(iteration);
            self.emit(RlmEvent::IterationStart {
                depth,
                iteration,
                max_iterations: opts.max_iterations,
            });

            if let Some(hooks) = &self.hooks {
                let state = IterationState {
                    iteration,
                    depth,
                    call_count: session.budget().call_count,
                    messages: history.messages(),
                    model: &model,
                    max_output_chars,
                };
                match hooks.before_iteration(&state).await {
                    IterationDirective::Continue => {}
                    IterationDirective::Modify(overrides) => {
                        if let Some(messages) = overrides.messages {
                            history.replace(messages);
                        }
                        if let Some(m) = overrides.model {
                            session.set_root_model(&m);
                            model = m;
                        }
                        if let Some(cap) = overrides.max_output_chars {
                            max_output_chars = cap;
                        }
                    }
                    IterationDirective::Finalize(answer) => {
                        return Ok(self.finish(session, answer, steps, iteration + 1));
                    }
                    IterationDirective::Abort(reason) => return Err(RlmError::HookAbort(reason)),
                }
            }

            let response = session.call_root(&model, history.messages()).await?.text;
            self.emit(RlmEvent::ModelResponse {
                depth,
                preview: preview(&response, EVENT_PREVIEW_CHARS),
            });

            // 只有第一个代码块有效；空块视为没有代码
            let code = parser::extract_code(&response)
                .into_iter()
                .next()
                .filter(|code| !code.is_empty());
            let mut marker = parser::extract_final(&response);
            let ran_code = code.is_some();

            if let Some(code) = code {
                let outcome = session.execute(&code).await?;
                if marker.is_none() {
                    marker = outcome.value.as_ref().and_then(parser::final_from_value);
                }
                let is_error = outcome.error.is_some();
                let composed = compose_output(&outcome);
                let total_chars = composed.chars().count();
                let output = truncate_output(&composed, max_output_chars);

                tracing::debug!(depth, iteration, output_chars = total_chars, is_error, "code executed");
                self.emit(RlmEvent::CodeExecuted {
                    depth,
                    iteration,
                    output_chars: total_chars,
                    is_error,
                    preview: preview(&output, EVENT_PREVIEW_CHARS),
                });

                history.push(Message::assistant(response.clone()));
                history.push(Message::user(prompts::execution_feedback(
                    &output,
                    total_chars,
                    is_error,
                    opts.preview_chars,
                )));
                steps.push(Step {
                    iteration,
                    reasoning: parser::strip_code(&response).trim().to_string(),
                    code,
                    output,
                });
            }

            match marker {
                Some(FinalMarker::Direct(answer)) => {
                    return Ok(self.finish(session, answer, steps, iteration + 1));
                }
                Some(FinalMarker::Variable(name)) => match session.read_binding(&name).await {
                    Some(value) => {
                        let answer = parser::render_value(&value);
                        return Ok(self.finish(session, answer, steps, iteration + 1));
                    }
                    None => {
                        tracing::debug!(depth, iteration, variable = %name, "FINAL_VAR unresolved");
                        if !ran_code {
                            history.push(Message::assistant(response));
                        }
                        let correction = prompts::unresolved_variable(&name);
                        self.emit(RlmEvent::Correction {
                            depth,
                            detail: correction.clone(),
                        });
                        history.push(Message::user(correction));
                    }
                },
                None if !ran_code => {
                    history.push(Message::assistant(response));
                    self.emit(RlmEvent::Correction {
                        depth,
                        detail: prompts::MISSING_CODE_BLOCK.to_string(),
                    });
                    history.push(Message::user(prompts::MISSING_CODE_BLOCK));
                }
                None => {}
            }
        }

        // 迭代耗尽：强制作答
        tracing::info!(depth, max_iterations = opts.max_iterations, "iteration cap reached, forcing final answer");
        self.emit(RlmEvent::Correction {
            depth,
            detail: prompts::FORCE_FINAL.to_string(),
        });
        history.push(Message::user(prompts::FORCE_FINAL));
        let response = session.call_root(&model, history.messages()).await?.text;
        let answer = match parser::extract_final(&response) {
            Some(FinalMarker::Direct(answer)) => answer,
            Some(FinalMarker::Variable(name)) => match session.read_binding(&name).await {
                Some(value) => parser::render_value(&value),
                None => response,
            },
            None => response,
        };
        Ok(self.finish(session, answer, steps, opts.max_iterations))
    }

    fn finish(&self, session: &Session, text: String, steps: Vec<Step>, iterations: u32) -> RlmResult {
        let call_count = session.budget().call_count;
        let usage = session.usage();
        tracing::info!(
            depth = self.options.depth,
            iterations,
            calls = call_count,
            total_tokens = usage.total_tokens,
            "rlm invocation finished"
        );
        self.emit(RlmEvent::Final {
            depth: self.options.depth,
            text: text.clone(),
            call_count,
            usage,
        });
        RlmResult {
            text,
            steps,
            call_count,
            iterations,
            usage,
        }
    }
}

/// 组合可观察输出：控制台文本 + 完成值（undefined / null 除外）+ 错误信息
pub fn compose_output(outcome: &ExecOutcome) -> String {
    let mut parts: Vec<String> = Vec::new();
    let stdout = outcome.stdout.trim_end();
    if !stdout.is_empty() {
        parts.push(stdout.to_string());
    }
    if let Some(value) = outcome.value.as_ref().filter(|v| !v.is_null()) {
        parts.push(parser::render_value(value));
    }
    if let Some(error) = &outcome.error {
        parts.push(format!("Error: {error}"));
    }
    parts.join("\n")
}

/// 超出上限时截断并追加固定标记
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &output[..idx], TRUNCATION_MARKER),
        None => output.to_string(),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
