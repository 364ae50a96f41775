//! Tool dispatch for the agentic loop.
//!
//! `<edward_command>` runs a read-only shell tool inside the chat's
//! sandbox; `<edward_web_search>` queries the configured search client.
//! Either way the outcome is plain text that becomes the tool-result
//! message of the next LLM turn.

use std::time::Duration;

use ed_domain::error::Error;
use ed_providers::WebSearchClient;

use crate::state::AppState;

/// Read-only tools the model may invoke. Compiled into the startup
/// RegexSet in `AppState`.
pub const COMMAND_ALLOWLIST: &[&str] = &[
    "^cat$", "^ls$", "^find$", "^head$", "^tail$", "^grep$", "^wc$",
];

/// Cap on tool output fed back into the conversation.
const MAX_TOOL_OUTPUT_CHARS: usize = 16_000;

/// Run an allowlisted read-only command in the sandbox. Returns
/// `(output_text, is_error)`.
pub async fn dispatch_command(
    state: &AppState,
    sandbox_id: Option<&str>,
    name: &str,
    args: &[String],
) -> (String, bool) {
    if !state.command_allowlist.is_match(name) {
        return (
            format!("command '{name}' is not in the read-only allowlist"),
            true,
        );
    }
    let Some(sandbox_id) = sandbox_id else {
        return ("no sandbox is attached to this chat yet".into(), true);
    };

    // Arguments are quoted individually; the command name is allowlisted
    // so the script shape is `name 'arg' 'arg'`.
    let mut script = name.to_string();
    for arg in args {
        if arg.contains('\0') {
            return ("arguments must not contain NUL bytes".into(), true);
        }
        script.push(' ');
        script.push_str(&shell_quote(arg));
    }

    match state
        .sandboxes
        .exec(sandbox_id, &script, None, Duration::from_secs(10))
        .await
    {
        Ok(out) => {
            let success = out.success();
            let mut text = out.stdout;
            if !success {
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(out.stderr.trim_end());
            }
            (clip(&text), !success)
        }
        Err(e) => (format!("command failed: {e}"), true),
    }
}

/// Run a web search and render results for the next turn.
pub async fn dispatch_web_search(state: &AppState, query: &str, max_results: u32) -> (String, bool) {
    match state.search.search(query, max_results as usize).await {
        Ok(results) if results.is_empty() => ("no results".into(), false),
        Ok(results) => {
            let rendered: Vec<String> = results
                .iter()
                .enumerate()
                .map(|(i, r)| format!("{}. {} — {}\n   {}", i + 1, r.title, r.url, r.snippet))
                .collect();
            (clip(&rendered.join("\n")), false)
        }
        Err(e @ Error::Validation(_)) => (format!("web search unavailable: {e}"), true),
        Err(e) => (format!("web search failed: {e}"), true),
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_TOOL_OUTPUT_CHARS {
        return text.to_string();
    }
    let mut end = MAX_TOOL_OUTPUT_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &text[..end])
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
