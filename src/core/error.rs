//! RLM 错误类型
//!
//! 可恢复错误（沙箱内的预算耗尽 / 执行失败 / 未解析变量）只会折叠进步骤输出或纠正提示，
//! 致命错误（服务失败 / Hook 中止 / 引擎故障）直接展开整个调用。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排循环与沙箱会话可能产生的错误
#[derive(Error, Debug)]
pub enum RlmError {
    /// 调用次数已达上限；被拒绝的调用不计数
    #[error("Budget exceeded: {used}/{max} model calls used")]
    BudgetExceeded { used: u32, max: u32 },

    #[error("Context already loaded into this session")]
    ContextAlreadyLoaded,

    /// 脚本抛错、超时或引用了不存在的桥接函数
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Text generation failed: {0}")]
    Service(#[from] LlmError),

    #[error("FINAL_VAR references an undefined variable: {0}")]
    UnresolvedVariable(String),

    #[error("Aborted by hook: {0}")]
    HookAbort(String),

    /// 沙箱引擎无法启动或违反了通信协议
    #[error("Sandbox engine error: {0}")]
    Engine(String),

    /// 配置文件或环境变量无法解析
    #[error("Config error: {0}")]
    Config(String),
}

impl RlmError {
    /// 致命错误：即使发生在沙箱桥接调用内部，也必须终止整个调用
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RlmError::Service(_)
                | RlmError::HookAbort(_)
                | RlmError::Engine(_)
                | RlmError::ContextAlreadyLoaded
        )
    }
}
