//! 预算与用量统计
//!
//! 每个会话独占一份 Accountant；子会话结束后，其最终调用次数与用量再合并进父会话（深度优先组合，非实时共享）。

use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::core::RlmError;

/// 子智能体的迭代下限
pub const MIN_CHILD_ITERATIONS: u32 = 5;
/// 子智能体的调用次数下限
pub const MIN_CHILD_CALLS: u32 = 10;

/// Token 用量：五个非负计数器，只做加法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub cached_tokens: u64,
}

impl UsageSummary {
    pub fn add(&mut self, other: &UsageSummary) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cached_tokens += other.cached_tokens;
    }

    /// 从服务商返回的 usage JSON 中提取用量，缺失或非数值字段按 0 处理。
    ///
    /// 同时识别 OpenAI 风格（prompt_tokens / completion_tokens / *_details）与
    /// input_tokens / output_tokens 风格的字段名。
    pub fn from_provider(usage: &Value) -> Self {
        let input = first_number(usage, &["prompt_tokens", "input_tokens"]);
        let output = first_number(usage, &["completion_tokens", "output_tokens"]);
        let total = match first_number(usage, &["total_tokens"]) {
            0 => input + output,
            n => n,
        };
        let reasoning = nested_number(usage, "completion_tokens_details", "reasoning_tokens")
            .max(nested_number(usage, "output_tokens_details", "reasoning_tokens"))
            .max(first_number(usage, &["reasoning_tokens"]));
        let cached = nested_number(usage, "prompt_tokens_details", "cached_tokens")
            .max(nested_number(usage, "input_tokens_details", "cached_tokens"))
            .max(first_number(usage, &["cached_tokens"]));
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: total,
            reasoning_tokens: reasoning,
            cached_tokens: cached,
        }
    }
}

fn coerce(value: Option<&Value>) -> u64 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() && n > 0.0 {
        n as u64
    } else {
        0
    }
}

fn first_number(usage: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .map(|k| coerce(usage.get(*k)))
        .find(|n| *n > 0)
        .unwrap_or(0)
}

fn nested_number(usage: &Value, outer: &str, inner: &str) -> u64 {
    coerce(usage.get(outer).and_then(|o| o.get(inner)))
}

/// 预算：调用次数、迭代、深度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Budget {
    pub call_count: u32,
    pub max_calls: u32,
    pub iteration: u32,
    pub max_iterations: u32,
    pub depth: u32,
    pub max_depth: u32,
}

impl Budget {
    pub fn new(max_calls: u32, max_iterations: u32, depth: u32, max_depth: u32) -> Self {
        Self {
            call_count: 0,
            max_calls,
            iteration: 0,
            max_iterations,
            depth,
            max_depth,
        }
    }

    pub fn remaining_calls(&self) -> u32 {
        self.max_calls.saturating_sub(self.call_count)
    }

    /// 到达深度下限：递归调用退化为普通子模型调用
    pub fn at_recursion_floor(&self) -> bool {
        self.depth + 1 >= self.max_depth
    }

    /// 子智能体的默认预算：减半并按下限截断
    pub fn child_limits(&self) -> (u32, u32) {
        (
            (self.max_iterations / 2).max(MIN_CHILD_ITERATIONS),
            (self.max_calls / 2).max(MIN_CHILD_CALLS),
        )
    }
}

/// 会话级计数器：检查-递增在同一个临界区内完成，锁从不跨 await 持有
#[derive(Debug)]
pub struct Accountant {
    budget: Mutex<Budget>,
    usage: Mutex<UsageSummary>,
}

impl Accountant {
    pub fn new(budget: Budget) -> Self {
        Self {
            budget: Mutex::new(budget),
            usage: Mutex::new(UsageSummary::default()),
        }
    }

    /// 预占一次调用；会超出上限的调用被拒绝且不计数
    pub fn try_consume_call(&self) -> Result<u32, RlmError> {
        let mut budget = lock(&self.budget);
        if budget.call_count >= budget.max_calls {
            return Err(RlmError::BudgetExceeded {
                used: budget.call_count,
                max: budget.max_calls,
            });
        }
        budget.call_count += 1;
        Ok(budget.call_count)
    }

    pub fn add_usage(&self, usage: &UsageSummary) {
        lock(&self.usage).add(usage);
    }

    /// 子会话完成后合并其最终计数
    pub fn merge_child(&self, calls: u32, usage: &UsageSummary) {
        {
            let mut budget = lock(&self.budget);
            budget.call_count = budget.call_count.saturating_add(calls);
        }
        self.add_usage(usage);
    }

    pub fn set_iteration(&self, iteration: u32) {
        lock(&self.budget).iteration = iteration;
    }

    pub fn budget(&self) -> Budget {
        *lock(&self.budget)
    }

    pub fn usage(&self) -> UsageSummary {
        *lock(&self.usage)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
