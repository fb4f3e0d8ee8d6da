//! 可插拔拦截点
//!
//! Orchestrator 在每轮迭代前、每次递归派生子智能体前询问 Hook；
//! Hook 可放行、修改（历史 / 模型 / 输出上限 / 子预算）、直接给出答案或中止。

use async_trait::async_trait;

use crate::rlm::history::Message;

/// 迭代前 Hook 可见的状态快照
#[derive(Debug, Clone, Copy)]
pub struct IterationState<'a> {
    pub iteration: u32,
    pub depth: u32,
    pub call_count: u32,
    pub messages: &'a [Message],
    pub model: &'a str,
    pub max_output_chars: usize,
}

/// 迭代前可覆盖的字段；None 表示保持不变
#[derive(Debug, Clone, Default)]
pub struct IterationOverrides {
    /// 整体替换对话历史
    pub messages: Option<Vec<Message>>,
    pub model: Option<String>,
    pub max_output_chars: Option<usize>,
}

/// 迭代前 Hook 的决定
#[derive(Debug, Clone, Default)]
pub enum IterationDirective {
    #[default]
    Continue,
    Modify(IterationOverrides),
    /// 立即以给定答案结束
    Finalize(String),
    /// 以给定原因致命中止
    Abort(String),
}

/// 即将派生的子智能体
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub prompt: &'a str,
    /// 子智能体所在深度
    pub depth: u32,
    pub max_iterations: u32,
    pub max_calls: u32,
}

/// 派生前 Hook 的决定
#[derive(Debug, Clone, Default)]
pub enum SpawnDirective {
    #[default]
    Continue,
    /// 覆盖默认的子预算
    Override {
        max_iterations: Option<u32>,
        max_calls: Option<u32>,
    },
    Abort(String),
}

/// Hook 集合；默认实现全部放行
#[async_trait]
pub trait RlmHooks: Send + Sync {
    async fn before_iteration(&self, _state: &IterationState<'_>) -> IterationDirective {
        IterationDirective::Continue
    }

    async fn before_spawn(&self, _request: &SpawnRequest<'_>) -> SpawnDirective {
        SpawnDirective::Continue
    }
}
