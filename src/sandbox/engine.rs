//! 脚本隔离引擎抽象
//!
//! 任何沙箱技术（子进程隔离、受限解释器……）只要满足 {load, execute, read_binding, dispose}
//! 即可接入；执行期间脚本发起的桥接调用通过 Bridge 回到宿主。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::RlmError;
use crate::rlm::parser::render_value;

/// 待分析的上下文：字符串、字符串序列或按键排序的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Context {
    Text(String),
    Chunks(Vec<String>),
    Record(BTreeMap<String, Value>),
}

impl Context {
    /// 从脚本传入的任意 JSON 值构造（recursiveAgentCall 的 subContext）
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Context::Text(s),
            Value::Array(items) => {
                Context::Chunks(items.iter().map(render_value).collect())
            }
            Value::Object(map) => Context::Record(map.into_iter().collect()),
            other => Context::Text(render_value(&other)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Context::Text(s) => Value::String(s.clone()),
            Context::Chunks(chunks) => {
                Value::Array(chunks.iter().cloned().map(Value::String).collect())
            }
            Context::Record(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
        }
    }

    pub fn total_chars(&self) -> usize {
        match self {
            Context::Text(s) => s.chars().count(),
            Context::Chunks(chunks) => chunks.iter().map(|c| c.chars().count()).sum(),
            Context::Record(map) => map
                .iter()
                .map(|(k, v)| k.chars().count() + render_value(v).chars().count())
                .sum(),
        }
    }

    /// 给模型看的上下文形态描述（类型、总长度、分块长度）
    pub fn describe(&self) -> String {
        match self {
            Context::Text(_) => format!("a string with {} total characters", self.total_chars()),
            Context::Chunks(chunks) => {
                let lengths: Vec<String> = chunks
                    .iter()
                    .take(100)
                    .map(|c| c.chars().count().to_string())
                    .collect();
                let more = if chunks.len() > 100 { ", ..." } else { "" };
                format!(
                    "an array of {} strings with {} total characters (chunk lengths: [{}{}])",
                    chunks.len(),
                    self.total_chars(),
                    lengths.join(", "),
                    more
                )
            }
            Context::Record(map) => {
                let keys: Vec<&str> = map.keys().take(50).map(String::as_str).collect();
                format!(
                    "an object with {} keys and {} total characters (keys: {})",
                    map.len(),
                    self.total_chars(),
                    keys.join(", ")
                )
            }
        }
    }
}

impl From<&str> for Context {
    fn from(s: &str) -> Self {
        Context::Text(s.to_string())
    }
}

impl From<String> for Context {
    fn from(s: String) -> Self {
        Context::Text(s)
    }
}

impl From<Vec<String>> for Context {
    fn from(chunks: Vec<String>) -> Self {
        Context::Chunks(chunks)
    }
}

/// 单次执行的可观察结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    /// 本次执行的控制台输出（每次 execute 前清空）
    pub stdout: String,
    /// 脚本抛错 / 超时 / 引用未定义符号
    pub error: Option<String>,
    /// 脚本完成值；undefined 为 None
    pub value: Option<Value>,
}

impl ExecOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// 脚本可见的宿主桥接调用
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    SemanticQuery { prompt: String },
    SemanticQueryBatch { prompts: Vec<String> },
    RecursiveAgentCall { prompt: String, context: Option<Context> },
}

impl BridgeCall {
    /// 解析引擎上报的调用名与参数；未知名称返回错误文本给脚本
    pub fn parse(name: &str, args: &Value) -> Result<Self, String> {
        let prompt = || {
            args.get("prompt")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| format!("{name} expects a string prompt"))
        };
        match name {
            "semantic_query" => Ok(BridgeCall::SemanticQuery { prompt: prompt()? }),
            "semantic_query_batch" => {
                let prompts = args
                    .get("prompts")
                    .and_then(Value::as_array)
                    .ok_or_else(|| "semanticQueryBatch expects an array of prompts".to_string())?
                    .iter()
                    .map(render_value)
                    .collect();
                Ok(BridgeCall::SemanticQueryBatch { prompts })
            }
            "recursive_agent_call" => {
                let context = match args.get("context") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(Context::from_value(v.clone())),
                };
                Ok(BridgeCall::RecursiveAgentCall {
                    prompt: prompt()?,
                    context,
                })
            }
            other => Err(format!("unknown bridge function: {other}")),
        }
    }
}

/// 宿主侧桥接：脚本调用在此挂起宿主直至结果返回
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Ok 为返回给脚本的值，Err 为在脚本中抛出的错误文本
    async fn call(&self, call: BridgeCall) -> Result<Value, String>;
}

/// 脚本隔离引擎
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// 将上下文绑定为脚本全局变量 `context`
    async fn load(&mut self, context: &Context) -> Result<(), RlmError>;

    /// 在时间预算内执行脚本；脚本错误与超时体现在 ExecOutcome.error 中，Err 仅表示引擎故障
    async fn execute(
        &mut self,
        code: &str,
        timeout: Duration,
        bridge: &dyn Bridge,
    ) -> Result<ExecOutcome, RlmError>;

    /// 读取当前会话中的绑定；undefined 为 None
    async fn read_binding(&mut self, name: &str) -> Result<Option<Value>, RlmError>;

    /// 释放引擎；幂等、尽力而为
    async fn dispose(&mut self);
}

/// 每个会话创建一个全新的引擎实例
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ScriptEngine>, RlmError>;
}
