//! Node.js 子进程沙箱引擎
//!
//! 每个会话一个 `node -e <runner>` 子进程，stdio 上跑按行分隔的 JSON 协议：
//! 宿主发送 load / exec / read，脚本执行中发起的桥接调用以 `bridge` 事件上报，
//! 宿主处理完后回写 `bridge_result`，脚本侧一直阻塞等待，因而在脚本看来是普通同步调用。
//!
//! Node 可执行文件只在进程内探测一次（OnceCell 守卫），之后所有会话复用。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::OnceCell;

use crate::core::RlmError;
use crate::sandbox::engine::{Bridge, BridgeCall, Context, EngineFactory, ExecOutcome, ScriptEngine};

const RUNNER_JS: &str = include_str!("runner.js");
/// 宿主侧兜底超时在脚本自身超时之外的宽限
const HOST_GRACE: Duration = Duration::from_secs(2);
/// 非执行类请求（load / read）的等待上限
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// 进程级 Node 运行时信息
#[derive(Debug, Clone)]
pub struct NodeRuntime {
    pub binary: String,
    pub version: String,
}

static NODE_RUNTIME: OnceCell<NodeRuntime> = OnceCell::const_new();

/// 探测 Node 可执行文件；整个进程只执行一次，后续调用直接复用结果。
/// 进程内只允许一个运行时，请求其他可执行文件时返回 Engine 错误。
pub async fn node_runtime(binary: &str) -> Result<&'static NodeRuntime, RlmError> {
    let runtime = NODE_RUNTIME
        .get_or_try_init(|| async {
            let output = Command::new(binary)
                .arg("--version")
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| RlmError::Engine(format!("failed to run `{binary} --version`: {e}")))?;
            if !output.status.success() {
                return Err(RlmError::Engine(format!(
                    "`{binary} --version` exited with {}",
                    output.status
                )));
            }
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            tracing::info!(binary = %binary, version = %version, "node sandbox runtime ready");
            Ok(NodeRuntime {
                binary: binary.to_string(),
                version,
            })
        })
        .await?;
    if runtime.binary != binary {
        return Err(RlmError::Engine(format!(
            "node runtime already initialized with `{}`, cannot switch to `{binary}`",
            runtime.binary
        )));
    }
    Ok(runtime)
}

/// 运行器上报的事件
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RunnerEvent {
    Ready {
        #[serde(default)]
        version: String,
    },
    Loaded,
    Bridge {
        name: String,
        #[serde(default)]
        args: Value,
    },
    Result {
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        defined: bool,
        #[serde(default)]
        value: Value,
    },
    Binding {
        #[serde(default)]
        defined: bool,
        #[serde(default)]
        value: Value,
    },
    ProtocolError {
        error: String,
    },
}

#[derive(Debug)]
struct NodeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl NodeProcess {
    async fn spawn(runtime: &NodeRuntime) -> Result<Self, RlmError> {
        let mut child = Command::new(&runtime.binary)
            .arg("-e")
            .arg(RUNNER_JS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RlmError::Engine(format!("failed to spawn `{}`: {e}", runtime.binary)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RlmError::Engine("failed to capture sandbox stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RlmError::Engine("failed to capture sandbox stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "rlm::sandbox", "node stderr: {}", line);
                }
            });
        }

        let mut process = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        match process.read_event_within(CONTROL_TIMEOUT).await? {
            RunnerEvent::Ready { version } => {
                tracing::debug!(version = %version, "sandbox runner started");
                Ok(process)
            }
            other => Err(RlmError::Engine(format!(
                "unexpected first message from sandbox runner: {:?}",
                other
            ))),
        }
    }

    async fn send(&mut self, value: &Value) -> Result<(), RlmError> {
        let mut line = serde_json::to_vec(value)
            .map_err(|e| RlmError::Engine(format!("failed to encode sandbox request: {e}")))?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|e| RlmError::Engine(format!("sandbox stdin closed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| RlmError::Engine(format!("sandbox stdin closed: {e}")))
    }

    async fn read_event(&mut self) -> Result<RunnerEvent, RlmError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| RlmError::Engine(format!("failed to read sandbox output: {e}")))?;
            if read == 0 {
                return Err(RlmError::Engine("sandbox process exited unexpectedly".to_string()));
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            RlmError::Engine(format!(
                "invalid message from sandbox runner: {e}; raw={}",
                truncate_for_log(line.trim())
            ))
        })
    }

    async fn read_event_within(&mut self, limit: Duration) -> Result<RunnerEvent, RlmError> {
        tokio::time::timeout(limit, self.read_event())
            .await
            .map_err(|_| RlmError::Engine(format!("sandbox runner did not answer within {:?}", limit)))?
    }

    async fn shutdown(mut self) {
        let _ = self.send(&json!({"type": "shutdown"})).await;
        let _ = self.stdin.shutdown().await;
        if tokio::time::timeout(Duration::from_millis(500), self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        self.child.start_kill().ok();
    }
}

/// Node.js 子进程引擎
#[derive(Debug)]
pub struct NodeEngine {
    runtime: &'static NodeRuntime,
    process: Option<NodeProcess>,
    /// 超时重启后需要重新加载的上下文
    context: Option<Value>,
}

impl NodeEngine {
    pub async fn start(binary: &str) -> Result<Self, RlmError> {
        let runtime = node_runtime(binary).await?;
        let process = NodeProcess::spawn(runtime).await?;
        Ok(Self {
            runtime,
            process: Some(process),
            context: None,
        })
    }

    fn process(&mut self) -> Result<&mut NodeProcess, RlmError> {
        self.process
            .as_mut()
            .ok_or_else(|| RlmError::Engine("sandbox already disposed".to_string()))
    }

    async fn send_context(&mut self) -> Result<(), RlmError> {
        let Some(context) = self.context.clone() else {
            return Ok(());
        };
        let process = self.process()?;
        process.send(&json!({"type": "load", "context": context})).await?;
        match process.read_event_within(CONTROL_TIMEOUT).await? {
            RunnerEvent::Loaded => Ok(()),
            RunnerEvent::ProtocolError { error } => Err(RlmError::Engine(error)),
            other => Err(RlmError::Engine(format!("unexpected reply to load: {:?}", other))),
        }
    }

    /// 兜底超时后重启子进程并重新加载上下文；已有变量绑定随之丢失
    async fn restart(&mut self) -> Result<(), RlmError> {
        if let Some(old) = self.process.take() {
            old.shutdown().await;
        }
        tracing::warn!("restarting node sandbox after timeout");
        self.process = Some(NodeProcess::spawn(self.runtime).await?);
        self.send_context().await
    }
}

#[async_trait]
impl ScriptEngine for NodeEngine {
    async fn load(&mut self, context: &Context) -> Result<(), RlmError> {
        self.context = Some(context.to_value());
        self.send_context().await
    }

    async fn execute(
        &mut self,
        code: &str,
        timeout: Duration,
        bridge: &dyn Bridge,
    ) -> Result<ExecOutcome, RlmError> {
        let timeout_ms = timeout.as_millis() as u64;
        self.process()?
            .send(&json!({"type": "exec", "code": code, "timeout_ms": timeout_ms}))
            .await?;

        loop {
            let waited = tokio::time::timeout(timeout + HOST_GRACE, self.process()?.read_event()).await;
            let event = match waited {
                Ok(event) => event?,
                Err(_) => {
                    self.restart().await?;
                    return Ok(ExecOutcome::failed(format!(
                        "execution timed out after {} ms (sandbox restarted, variables were reset)",
                        timeout_ms
                    )));
                }
            };
            match event {
                RunnerEvent::Bridge { name, args } => {
                    let reply = match BridgeCall::parse(&name, &args) {
                        Ok(call) => bridge.call(call).await,
                        Err(e) => Err(e),
                    };
                    let payload = match reply {
                        Ok(value) => json!({"type": "bridge_result", "ok": true, "value": value}),
                        Err(error) => json!({"type": "bridge_result", "ok": false, "error": error}),
                    };
                    self.process()?.send(&payload).await?;
                }
                RunnerEvent::Result {
                    stdout,
                    error,
                    defined,
                    value,
                } => {
                    return Ok(ExecOutcome {
                        stdout,
                        error,
                        value: defined.then_some(value),
                    });
                }
                RunnerEvent::ProtocolError { error } => return Err(RlmError::Engine(error)),
                other => {
                    return Err(RlmError::Engine(format!(
                        "unexpected message during execution: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn read_binding(&mut self, name: &str) -> Result<Option<Value>, RlmError> {
        let process = self.process()?;
        process.send(&json!({"type": "read", "name": name})).await?;
        match process.read_event_within(CONTROL_TIMEOUT).await? {
            RunnerEvent::Binding { defined, value } => Ok(defined.then_some(value)),
            other => Err(RlmError::Engine(format!("unexpected reply to read: {:?}", other))),
        }
    }

    async fn dispose(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown().await;
        }
    }
}

/// 为每个会话启动一个新的 Node 子进程
#[derive(Debug, Clone)]
pub struct NodeEngineFactory {
    binary: String,
}

impl NodeEngineFactory {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NodeEngineFactory {
    fn default() -> Self {
        Self::new("node")
    }
}

#[async_trait]
impl EngineFactory for NodeEngineFactory {
    async fn create(&self) -> Result<Box<dyn ScriptEngine>, RlmError> {
        Ok(Box::new(NodeEngine::start(&self.binary).await?))
    }
}

fn truncate_for_log(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}
