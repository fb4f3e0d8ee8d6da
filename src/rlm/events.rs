//! 编排过程事件：用于向前端 / 日志推送迭代、代码执行、子智能体与最终答案

use serde::Serialize;

use crate::rlm::budget::UsageSummary;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RlmEvent {
    /// 新一轮迭代开始
    IterationStart {
        depth: u32,
        iteration: u32,
        max_iterations: u32,
    },
    /// 根模型回复（预览）
    ModelResponse { depth: u32, preview: String },
    /// 代码已执行（输出预览）
    CodeExecuted {
        depth: u32,
        iteration: u32,
        output_chars: usize,
        is_error: bool,
        preview: String,
    },
    /// 派生子智能体
    SubAgentSpawned {
        depth: u32,
        max_iterations: u32,
        max_calls: u32,
    },
    /// 纠正提示（缺少代码块 / FINAL_VAR 未定义 / 迭代耗尽）
    Correction { depth: u32, detail: String },
    /// 最终答案
    Final {
        depth: u32,
        text: String,
        call_count: u32,
        usage: UsageSummary,
    },
}
