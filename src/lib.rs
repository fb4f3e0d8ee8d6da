//! RLM - 递归语言模型智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **rlm**: 编排主循环、回复解析、预算与用量、Hook、事件
//! - **sandbox**: 脚本隔离引擎（Node.js 子进程）与会话桥接

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod rlm;
pub mod sandbox;

pub use crate::core::RlmError;
pub use crate::rlm::{Orchestrator, RlmOptions, RlmResult};
pub use crate::sandbox::Context;
