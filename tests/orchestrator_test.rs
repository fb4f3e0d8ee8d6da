//! 编排主循环集成测试：MockLlmClient + 内存脚本引擎

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use rlm::llm::{LlmError, MockLlmClient};
use rlm::rlm::prompts::{FORCE_FINAL, MISSING_CODE_BLOCK};
use rlm::rlm::{
    IterationDirective, IterationOverrides, IterationState, RlmEvent, RlmHooks, SpawnDirective,
    SpawnRequest, UsageSummary, TRUNCATION_MARKER,
};
use rlm::sandbox::{Bridge, BridgeCall, Context, EngineFactory, ExecOutcome, ScriptEngine};
use rlm::{Orchestrator, RlmError, RlmOptions};

/// 所有引擎实例共享的记录
#[derive(Default)]
struct EngineLog {
    executed: Mutex<Vec<String>>,
    created: AtomicUsize,
    disposed: AtomicUsize,
}

impl EngineLog {
    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

/// 逐行解释的极简脚本引擎：
/// `print:<text>` / `set:<name>=<json>` / `value:<json>` / `fail:<msg>` /
/// `big:<n>` / `q:<prompt>` / `rec:<prompt>` / `final:<text>`
struct FakeEngine {
    bindings: HashMap<String, Value>,
    log: Arc<EngineLog>,
}

#[async_trait]
impl ScriptEngine for FakeEngine {
    async fn load(&mut self, context: &Context) -> Result<(), RlmError> {
        self.bindings.insert("context".into(), context.to_value());
        Ok(())
    }

    async fn execute(
        &mut self,
        code: &str,
        _timeout: Duration,
        bridge: &dyn Bridge,
    ) -> Result<ExecOutcome, RlmError> {
        self.log.executed.lock().unwrap().push(code.to_string());
        let mut out = ExecOutcome::default();
        for line in code.lines() {
            let (cmd, arg) = line.split_once(':').unwrap_or((line, ""));
            match cmd {
                "print" => out.stdout.push_str(&format!("{arg}\n")),
                "set" => {
                    let (name, raw) = arg.split_once('=').unwrap();
                    self.bindings
                        .insert(name.to_string(), serde_json::from_str(raw).unwrap());
                }
                "value" => out.value = Some(serde_json::from_str(arg).unwrap()),
                "fail" => {
                    out.error = Some(arg.to_string());
                    return Ok(out);
                }
                "big" => out.stdout.push_str(&"x".repeat(arg.parse().unwrap())),
                "q" | "rec" => {
                    let call = if cmd == "q" {
                        BridgeCall::SemanticQuery { prompt: arg.into() }
                    } else {
                        BridgeCall::RecursiveAgentCall { prompt: arg.into(), context: None }
                    };
                    match bridge.call(call).await {
                        Ok(v) => out.stdout.push_str(&format!("{}\n", v.as_str().unwrap_or(""))),
                        Err(e) => {
                            out.error = Some(e);
                            return Ok(out);
                        }
                    }
                }
                "final" => out.value = Some(json!({"__rlm_final__": "direct", "value": arg})),
                _ => {}
            }
        }
        Ok(out)
    }

    async fn read_binding(&mut self, name: &str) -> Result<Option<Value>, RlmError> {
        Ok(self.bindings.get(name).cloned())
    }

    async fn dispose(&mut self) {
        self.log.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeFactory {
    log: Arc<EngineLog>,
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn create(&self) -> Result<Box<dyn ScriptEngine>, RlmError> {
        self.log.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEngine {
            bindings: HashMap::new(),
            log: self.log.clone(),
        }))
    }
}

fn options() -> RlmOptions {
    RlmOptions {
        root_model: "root".into(),
        sub_model: "sub".into(),
        ..RlmOptions::default()
    }
}

fn agent(llm: Arc<MockLlmClient>, options: RlmOptions) -> (Orchestrator, Arc<EngineLog>) {
    let log = Arc::new(EngineLog::default());
    let agent = Orchestrator::new(llm, options)
        .with_engine_factory(Arc::new(FakeFactory { log: log.clone() }));
    (agent, log)
}

fn code(body: &str) -> String {
    format!("Let me look.\n```javascript\n{body}\n```")
}

#[tokio::test]
async fn test_only_first_block_is_executed() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response(
        "root",
        "Two blocks:\n```js\nprint:one\n```\nand\n```js\nprint:two\n```",
    );
    llm.push_response("root", "FINAL(done)");
    let (agent, log) = agent(llm, options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "done");
    assert_eq!(log.executed(), vec!["print:one"]);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].output, "one");
    assert_eq!(result.steps[0].code, "print:one");
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn test_marker_inside_fence_is_inert() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "```js\nprint:FINAL(wrong)\n```");
    llm.push_response("root", "FINAL(right)");
    let (agent, _) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "right");
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_final_var_resolves_after_code_runs() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response(
        "root",
        "```js\nset:answer=\"forty-two\"\n```\nFINAL_VAR(answer)",
    );
    let (agent, log) = agent(llm, options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "forty-two");
    assert_eq!(result.iterations, 1);
    assert_eq!(log.executed().len(), 1);
}

#[tokio::test]
async fn test_final_var_renders_non_string_as_json() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "```js\nset:counts={\"a\":1}\n```\nFINAL_VAR(counts)");
    let (agent, _) = agent(llm, options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, r#"{"a":1}"#);
}

#[tokio::test]
async fn test_unresolved_variable_gets_corrective_turn() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "I am done. FINAL_VAR(missing)");
    llm.push_response("root", "FINAL(ok)");
    let (agent, _) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "ok");

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].last_user.contains("FINAL_VAR(missing)"));
    assert!(requests[1].last_user.contains("not defined"));
    // system + query + assistant + correction
    assert_eq!(requests[1].message_count, 4);
}

#[tokio::test]
async fn test_unresolved_variable_after_code_ran() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "```js\nprint:a\n```\nFINAL_VAR(missing)");
    llm.push_response("root", "FINAL(ok)");
    let (agent, log) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "ok");
    assert_eq!(result.iterations, 2);
    assert_eq!(log.executed(), vec!["print:a"]);

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].last_user.contains("FINAL_VAR(missing)"));
    // system + query + assistant + execution feedback + correction
    assert_eq!(requests[1].message_count, 5);
}

#[tokio::test]
async fn test_empty_first_block_counts_as_no_code() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "```js\n```\nthen\n```js\nprint:second\n```");
    llm.push_response("root", "FINAL(x)");
    let (agent, log) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "x");
    assert!(log.executed().is_empty());
    assert!(result.steps.is_empty());
    assert_eq!(llm.requests()[1].last_user, MISSING_CODE_BLOCK);
}

#[tokio::test]
async fn test_prose_final_with_space_does_not_finish() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response(
        "root",
        "Next I will inspect the final (third) chunk.\n```js\nprint:chunk\n```",
    );
    llm.push_response("root", "FINAL(done)");
    let (agent, _) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "done");
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn test_missing_code_block_gets_corrective_turn() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "Hmm, let me think about it.");
    llm.push_response("root", "FINAL(x)");
    let (agent, log) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "x");
    assert!(log.executed().is_empty());
    assert_eq!(llm.requests()[1].last_user, MISSING_CODE_BLOCK);
}

#[tokio::test]
async fn test_iteration_cap_forces_final_answer() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("print:a"));
    llm.push_response("root", code("print:b"));
    llm.push_response("root", "Best guess: FINAL(best)");
    let (agent, _) = agent(llm.clone(), RlmOptions { max_iterations: 2, ..options() });

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "best");
    assert_eq!(result.iterations, 2);
    assert_eq!(result.steps.len(), 2);

    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].last_user, FORCE_FINAL);
}

#[tokio::test]
async fn test_forced_answer_without_marker_uses_raw_text() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("print:a"));
    llm.push_response("root", "It is probably 7.");
    let (agent, _) = agent(llm, RlmOptions { max_iterations: 1, ..options() });

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "It is probably 7.");
}

#[tokio::test]
async fn test_large_output_is_truncated_and_previewed() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("big:1000000"));
    llm.push_response("root", "FINAL(done)");
    let opts = RlmOptions {
        max_output_chars: 100_000,
        preview_chars: 500,
        ..options()
    };
    let (agent, _) = agent(llm.clone(), opts);

    let result = agent.generate("ctx", "q").await.unwrap();
    let output = &result.steps[0].output;
    assert!(output.chars().count() <= 100_000 + TRUNCATION_MARKER.chars().count());
    assert!(output.ends_with(TRUNCATION_MARKER));

    let feedback = &llm.requests()[1].last_user;
    assert!(feedback.contains("1000000 chars"));
    assert!(feedback.chars().count() < 700);
}

#[tokio::test]
async fn test_script_error_is_fed_back_and_loop_continues() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("fail:ReferenceError: foo is not defined"));
    llm.push_response("root", "FINAL(recovered)");
    let (agent, _) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "recovered");
    assert_eq!(result.steps[0].output, "Error: ReferenceError: foo is not defined");
    assert!(llm.requests()[1].last_user.starts_with("Execution failed"));
}

#[tokio::test]
async fn test_final_envelope_from_completion_value() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("print:working\nfinal:abc"));
    let (agent, _) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "abc");
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_recursion_merges_child_counts() {
    let usage = UsageSummary {
        input_tokens: 6,
        output_tokens: 4,
        total_tokens: 10,
        ..Default::default()
    };
    let llm = Arc::new(MockLlmClient::new().with_usage(usage));
    // 父：派生子智能体
    llm.push_response("root", code("rec:summarize part one"));
    // 子：一次子模型调用后作答
    llm.push_response("root", code("q:inner"));
    llm.push_response("root", "FINAL(child answer)");
    // 父：收尾
    llm.push_response("root", "FINAL(parent done)");
    let (agent, log) = agent(llm.clone(), options());

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "parent done");
    assert_eq!(result.steps[0].output, "child answer");
    assert_eq!(result.call_count, 5);
    assert_eq!(llm.call_count(), 5);
    assert_eq!(result.usage.total_tokens, 50);
    assert_eq!(result.usage.input_tokens, 30);
    assert_eq!(log.created.load(Ordering::SeqCst), 2);
    assert_eq!(log.disposed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_service_error_is_fatal_and_session_released() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("q:hello"));
    llm.push_failure("sub", "503 Service Unavailable");
    let (agent, log) = agent(llm, options());

    let err = agent.generate("ctx", "q").await.unwrap_err();
    assert!(matches!(err, RlmError::Service(LlmError::Request(_))));
    assert_eq!(log.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_root_call_over_budget_is_fatal() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("print:a"));
    let (agent, log) = agent(llm.clone(), RlmOptions { max_calls: 1, ..options() });

    let err = agent.generate("ctx", "q").await.unwrap_err();
    assert!(matches!(err, RlmError::BudgetExceeded { used: 1, max: 1 }));
    assert_eq!(llm.call_count(), 1);
    assert_eq!(log.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_signal_fails_model_call() {
    let token = CancellationToken::new();
    token.cancel();
    let llm = Arc::new(MockLlmClient::new());
    let (agent, _) = agent(llm.clone(), options().with_signal(token));

    let err = agent.generate("ctx", "q").await.unwrap_err();
    assert!(matches!(err, RlmError::Service(LlmError::Cancelled)));
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn test_generate_stream_yields_single_chunk() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", "FINAL(streamed)");
    let (agent, _) = agent(llm, options());

    let mut stream = agent.generate_stream("ctx", "q");
    assert_eq!(stream.next().await.unwrap().unwrap(), "streamed");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_events_end_with_final() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("print:a"));
    llm.push_response("root", "FINAL(done)");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (agent, _) = agent(llm, options());
    let agent = agent.with_event_tx(tx);

    agent.generate("ctx", "q").await.unwrap();
    drop(agent);

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    assert!(matches!(events.first(), Some(RlmEvent::IterationStart { iteration: 0, .. })));
    assert!(events.iter().any(|e| matches!(e, RlmEvent::CodeExecuted { is_error: false, .. })));
    assert!(matches!(events.last(), Some(RlmEvent::Final { text, call_count: 2, .. }) if text == "done"));
}

struct FinalizeHook;

#[async_trait]
impl RlmHooks for FinalizeHook {
    async fn before_iteration(&self, _state: &IterationState<'_>) -> IterationDirective {
        IterationDirective::Finalize("from hook".into())
    }
}

struct AbortHook;

#[async_trait]
impl RlmHooks for AbortHook {
    async fn before_iteration(&self, state: &IterationState<'_>) -> IterationDirective {
        if state.iteration >= 1 {
            IterationDirective::Abort("too slow".into())
        } else {
            IterationDirective::Continue
        }
    }
}

struct ModelSwapHook;

#[async_trait]
impl RlmHooks for ModelSwapHook {
    async fn before_iteration(&self, _state: &IterationState<'_>) -> IterationDirective {
        IterationDirective::Modify(IterationOverrides {
            model: Some("big".into()),
            ..Default::default()
        })
    }
}

/// 只在顶层替换根模型
struct TopLevelModelHook;

#[async_trait]
impl RlmHooks for TopLevelModelHook {
    async fn before_iteration(&self, state: &IterationState<'_>) -> IterationDirective {
        if state.depth == 0 {
            IterationDirective::Modify(IterationOverrides {
                model: Some("big".into()),
                ..Default::default()
            })
        } else {
            IterationDirective::Continue
        }
    }
}

struct SpawnLimitHook {
    seen: Mutex<Vec<(u32, u32, u32)>>,
}

#[async_trait]
impl RlmHooks for SpawnLimitHook {
    async fn before_spawn(&self, request: &SpawnRequest<'_>) -> SpawnDirective {
        self.seen
            .lock()
            .unwrap()
            .push((request.depth, request.max_iterations, request.max_calls));
        SpawnDirective::Override {
            max_iterations: Some(2),
            max_calls: Some(3),
        }
    }
}

struct SpawnAbortHook;

#[async_trait]
impl RlmHooks for SpawnAbortHook {
    async fn before_spawn(&self, _request: &SpawnRequest<'_>) -> SpawnDirective {
        SpawnDirective::Abort("no sub-agents".into())
    }
}

#[tokio::test]
async fn test_hook_finalize_skips_model() {
    let llm = Arc::new(MockLlmClient::new());
    let (agent, _) = agent(llm.clone(), options());
    let agent = agent.with_hooks(Arc::new(FinalizeHook));

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "from hook");
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn test_hook_abort_is_fatal() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("print:a"));
    let (agent, log) = agent(llm, options());
    let agent = agent.with_hooks(Arc::new(AbortHook));

    let err = agent.generate("ctx", "q").await.unwrap_err();
    assert!(matches!(err, RlmError::HookAbort(ref r) if r == "too slow"));
    assert_eq!(log.disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hook_swaps_model() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("big", "FINAL(big answer)");
    let (agent, _) = agent(llm.clone(), options());
    let agent = agent.with_hooks(Arc::new(ModelSwapHook));

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "big answer");
    assert!(llm.requests().iter().all(|r| r.model == "big"));
}

#[tokio::test]
async fn test_spawn_hook_overrides_child_budget() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("rec:part"));
    llm.push_response("root", "FINAL(child)");
    llm.push_response("root", "FINAL(parent)");
    let hook = Arc::new(SpawnLimitHook { seen: Mutex::new(Vec::new()) });
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (agent, _) = agent(llm, RlmOptions { max_calls: 50, max_iterations: 20, ..options() });
    let agent = agent.with_hooks(hook.clone()).with_event_tx(tx);

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "parent");
    // 默认子预算：迭代 20/2=10，调用 50/2=25
    assert_eq!(hook.seen.lock().unwrap().clone(), vec![(1, 10, 25)]);

    drop(agent);
    let mut spawned = None;
    while let Some(ev) = rx.recv().await {
        if let RlmEvent::SubAgentSpawned { depth, max_iterations, max_calls } = ev {
            spawned = Some((depth, max_iterations, max_calls));
        }
    }
    assert_eq!(spawned, Some((1, 2, 3)));
}

#[tokio::test]
async fn test_spawn_hook_abort_is_fatal() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("root", code("rec:part"));
    let (agent, _) = agent(llm, options());
    let agent = agent.with_hooks(Arc::new(SpawnAbortHook));

    let err = agent.generate("ctx", "q").await.unwrap_err();
    assert!(matches!(err, RlmError::HookAbort(_)));
}

#[tokio::test]
async fn test_child_inherits_swapped_model() {
    let llm = Arc::new(MockLlmClient::new());
    llm.push_response("big", code("rec:part"));
    llm.push_response("big", "FINAL(child)");
    llm.push_response("big", "FINAL(parent)");
    let (agent, _) = agent(llm.clone(), options());
    let agent = agent.with_hooks(Arc::new(TopLevelModelHook));

    let result = agent.generate("ctx", "q").await.unwrap();
    assert_eq!(result.text, "parent");
    assert_eq!(result.steps[0].output, "child");
    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.model == "big"));
}
