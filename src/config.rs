//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RLM__*` 覆盖（双下划线表示嵌套，如 `RLM__RLM__MAX_CALLS=20`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::RlmError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub rlm: RlmSection,
    pub sandbox: SandboxSection,
}

/// [llm] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 根模型
    #[serde(default = "default_model")]
    pub model: String,
    /// semanticQuery 使用的子模型，未设置时与根模型相同
    pub sub_model: Option<String>,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            sub_model: None,
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// [rlm] 段：迭代、调用与递归预算
#[derive(Debug, Clone, Deserialize)]
pub struct RlmSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// 单次脚本执行预算（毫秒）
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
}

impl Default for RlmSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_calls: default_max_calls(),
            max_depth: default_max_depth(),
            max_output_chars: default_max_output_chars(),
            preview_chars: default_preview_chars(),
            exec_timeout_ms: default_exec_timeout_ms(),
        }
    }
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_calls() -> u32 {
    50
}

fn default_max_depth() -> u32 {
    2
}

fn default_max_output_chars() -> usize {
    100_000
}

fn default_preview_chars() -> usize {
    500
}

fn default_exec_timeout_ms() -> u64 {
    60_000
}

/// [sandbox] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// Node.js 可执行文件
    #[serde(default = "default_node_binary")]
    pub node_binary: String,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            node_binary: default_node_binary(),
        }
    }
}

fn default_node_binary() -> String {
    "node".to_string()
}

/// 从 config 目录加载配置，环境变量 RLM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RLM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, RlmError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RLM")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| RlmError::Config(e.to_string()))
}
