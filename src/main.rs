//! RLM 命令行入口
//!
//! 用法：`rlm <context-file> <query...>`
//! 上下文文件为 .json 时按 JSON 解析（字符串 / 字符串数组 / 对象），否则整体作为文本。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use rlm::config::{load_config, AppConfig};
use rlm::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use rlm::sandbox::{Context, NodeEngineFactory};
use rlm::{Orchestrator, RlmOptions};

/// 根据配置与环境变量选择 LLM 后端；无可用 Key 时退回 Mock
fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = cfg.llm.request_timeout_secs;
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    if provider == "mock" {
        tracing::warn!("Using Mock LLM (provider = mock)");
        return Arc::new(MockLlmClient::new());
    }
    if provider == "deepseek" && (has_deepseek_key || has_openai_key) {
        tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
        Arc::new(create_deepseek_client(cfg.llm.base_url.as_deref()).with_timeout_secs(timeout))
    } else if has_openai_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), None).with_timeout_secs(timeout))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}

fn read_context(path: &Path) -> anyhow::Result<Context> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read context file {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let value: serde_json::Value =
            serde_json::from_str(&raw).context("Context file is not valid JSON")?;
        return Ok(Context::from_value(value));
    }
    Ok(Context::Text(raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rlm::observability::init();

    let mut args = std::env::args().skip(1);
    let Some(context_path) = args.next().map(PathBuf::from) else {
        bail!("usage: rlm <context-file> <query...>");
    };
    let query = args.collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        bail!("usage: rlm <context-file> <query...>");
    }

    let cfg = load_config(None).context("Failed to load configuration")?;
    let context = read_context(&context_path)?;
    let llm = create_llm_from_config(&cfg);

    let agent = Orchestrator::new(llm, RlmOptions::from_config(&cfg))
        .with_engine_factory(Arc::new(NodeEngineFactory::new(cfg.sandbox.node_binary.clone())));

    let result = agent
        .generate(context, &query)
        .await
        .context("RLM invocation failed")?;

    println!("{}", result.text);
    eprintln!(
        "[{} iterations, {} model calls, {} tokens (in {} / out {})]",
        result.iterations,
        result.call_count,
        result.usage.total_tokens,
        result.usage.input_tokens,
        result.usage.output_tokens
    );
    Ok(())
}
