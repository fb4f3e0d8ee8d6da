//! 递归编排：主循环、回复解析、预算与用量、Hook、事件

pub mod budget;
pub mod events;
pub mod history;
pub mod hooks;
pub mod orchestrator;
pub mod parser;
pub mod prompts;

pub use budget::{Accountant, Budget, UsageSummary};
pub use events::RlmEvent;
pub use history::{History, Message, Role};
pub use hooks::{
    IterationDirective, IterationOverrides, IterationState, RlmHooks, SpawnDirective,
    SpawnRequest,
};
pub use orchestrator::{Orchestrator, RlmOptions, RlmResult, Step, TRUNCATION_MARKER};
pub use parser::FinalMarker;
