//! 提示词：系统提示、执行反馈与各类纠正指令

use crate::rlm::history::Message;
use crate::sandbox::engine::Context;

const SYSTEM_PROMPT: &str = r#"You are tasked with answering a query about a context that is too large to read directly.
You can inspect the context by writing JavaScript that runs in a persistent sandbox. Variables you declare stay available in later steps.

The sandbox provides:
- `context`: the input data ({context_description}).
- `console.log(...)` / `console.error(...)` / `print(...)`: print output. You only see a short preview of what you print, so print summaries, not whole documents.
- `semanticQuery(prompt)`: ask a smaller language model a question and get its answer as a string. It can read far more text than you can see, so pass it large slices of the context.
- `semanticQueryBatch(prompts)`: run many semanticQuery prompts concurrently; returns an array of answers in the same order.
- `recursiveAgentCall(prompt, subContext)`: delegate a sub-problem to a sub-agent that works like you over `subContext` and returns its answer as a string.{recursion_note}
All of these are ordinary synchronous calls. Do not use `await`.

You have a budget of {max_calls} model calls and {max_iterations} steps.

Each reply must contain exactly one fenced code block:
```javascript
const head = context.slice(0, 2000);
console.log(head);
```
Only the first code block in a reply is executed.

When you are done, answer OUTSIDE of any code block with either:
- FINAL(your answer) to answer directly, or
- FINAL_VAR(variableName) to answer with the value of a variable you created in the sandbox.
Make sure a variable exists before you reference it with FINAL_VAR."#;

/// 无代码块时的纠正指令
pub const MISSING_CODE_BLOCK: &str = "Your reply did not contain a fenced code block. Write JavaScript in a ```javascript block to continue analysing `context`, or answer with FINAL(...) / FINAL_VAR(...) outside of any code block.";

/// 迭代耗尽时的强制作答指令
pub const FORCE_FINAL: &str = "You have run out of steps. Based on everything you have learned so far, give your best final answer now as FINAL(your answer). Do not write any more code.";

/// 初始对话：系统提示 + 查询
pub fn initial_messages(
    context: &Context,
    query: &str,
    depth: u32,
    max_depth: u32,
    max_calls: u32,
    max_iterations: u32,
    system_override: Option<&str>,
) -> Vec<Message> {
    let recursion_note = if depth + 1 >= max_depth {
        " At this depth it simply behaves like semanticQuery."
    } else {
        ""
    };
    let base = system_override.unwrap_or(SYSTEM_PROMPT);
    let system = base
        .replace("{context_description}", &context.describe())
        .replace("{recursion_note}", recursion_note)
        .replace("{max_calls}", &max_calls.to_string())
        .replace("{max_iterations}", &max_iterations.to_string());

    let mut user = format!("Query: {query}");
    if depth > 0 {
        user.push_str(&format!(
            "\n\n(You are a sub-agent at depth {depth}; answer only this query.)"
        ));
    }
    vec![Message::system(system), Message::user(user)]
}

/// 代码执行后的反馈：只带有限预览、总长度与错误标记，不带完整输出
pub fn execution_feedback(output: &str, total_chars: usize, is_error: bool, preview_chars: usize) -> String {
    let mut preview: String = output.chars().take(preview_chars).collect();
    if total_chars > preview_chars {
        preview.push_str("...");
    }
    let status = if is_error { "failed" } else { "succeeded" };
    if output.is_empty() {
        format!("Execution {status}. Output: 0 chars (no output).")
    } else {
        format!("Execution {status}. Output: {total_chars} chars. Preview:\n{preview}")
    }
}

/// FINAL_VAR 指向未定义变量时的纠正指令
pub fn unresolved_variable(name: &str) -> String {
    format!(
        "FINAL_VAR({name}) refers to a variable that is not defined in the sandbox. Define `{name}` in a code block, print it to verify its value, and then answer with FINAL_VAR({name}) again."
    )
}
