//! 响应解析：提取围栏代码块与 FINAL / FINAL_VAR 标记
//!
//! 纯函数，无依赖。标记识别是文本模式匹配而非代码解析；围栏内的标记一律无效。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// 沙箱内 `FINAL(...)` / `FINAL_VAR(...)` 构造的结果信封字段名
pub const FINAL_ENVELOPE_KEY: &str = "__rlm_final__";

/// 最终答案标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalMarker {
    /// `FINAL(<value>)`：字面量
    Direct(String),
    /// `FINAL_VAR(<identifier>)`：引用会话中的变量
    Variable(String),
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+#.\-]*[ \t]*\r?\n(.*?)```").expect("fence regex")
    })
}

fn final_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bFINAL_VAR\(([^)]*)\)").expect("final_var regex"))
}

fn final_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bFINAL\(").expect("final regex"))
}

/// 按出现顺序返回所有围栏代码块内容（语言标签可选，内容已 trim，空块保留）；调用方只使用第一个
pub fn extract_code(text: &str) -> Vec<String> {
    fence_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

/// 去掉全部围栏代码块；未闭合的围栏从开头一直删到文本末尾
pub fn strip_code(text: &str) -> String {
    let stripped = fence_re().replace_all(text, "");
    match stripped.find("```") {
        Some(idx) => stripped[..idx].to_string(),
        None => stripped.into_owned(),
    }
}

/// 从（去掉代码块后的）文本中提取最终答案标记：先查 FINAL_VAR，再查 FINAL
pub fn extract_final(text: &str) -> Option<FinalMarker> {
    let prose = strip_code(text);

    if let Some(caps) = final_var_re().captures(&prose) {
        let name = trim_quotes(caps.get(1).map(|m| m.as_str()).unwrap_or(""));
        if !name.is_empty() {
            return Some(FinalMarker::Variable(name.to_string()));
        }
    }

    let start = final_re().find(&prose)?;
    let inner = balanced_slice(&prose[start.end()..]);
    let value = trim_quotes(inner);
    if value.is_empty() {
        None
    } else {
        Some(FinalMarker::Direct(value.to_string()))
    }
}

/// 识别沙箱返回值中的 FINAL / FINAL_VAR 信封
pub fn final_from_value(value: &Value) -> Option<FinalMarker> {
    let obj = value.as_object()?;
    match obj.get(FINAL_ENVELOPE_KEY)?.as_str()? {
        "direct" => {
            let rendered = obj.get("value").map(render_value).unwrap_or_default();
            Some(FinalMarker::Direct(rendered))
        }
        "variable" => {
            let name = obj.get("name")?.as_str()?.trim();
            (!name.is_empty()).then(|| FinalMarker::Variable(name.to_string()))
        }
        _ => None,
    }
}

/// 将 JSON 值渲染为答案文本：字符串原样返回，其余取紧凑 JSON
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 取到与开括号匹配的右括号为止；括号不平衡时退化为最后一个右括号（都没有则取到末尾）
fn balanced_slice(rest: &str) -> &str {
    let mut depth = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' if depth == 0 => return &rest[..idx],
            ')' => depth -= 1,
            _ => {}
        }
    }
    match rest.rfind(')') {
        Some(idx) => &rest[..idx],
        None => rest,
    }
}

fn trim_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim()
}
