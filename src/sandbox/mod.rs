//! 沙箱：引擎抽象、Node.js 子进程实现与会话

pub mod engine;
pub mod node;
pub mod session;

pub use engine::{Bridge, BridgeCall, Context, EngineFactory, ExecOutcome, ScriptEngine};
pub use node::{NodeEngine, NodeEngineFactory};
pub use session::Session;
