//! Extraction of the last genuine user-submitted message from an agent log
//! line (§4.7/§4.8), used by the log poller to populate `lastUserMessage`
//! and by the matcher to correlate a log file with the tmux window that
//! produced it. For extracting a message from the pane's own rendered text
//! instead of a structured log line, see `detector::pane_message` (§4.5).
//!
//! A "genuine" user message excludes tool-result echoes: Claude's
//! `toolUseResult`/`tool_result` blocks and Codex's `custom_tool_call_output`
//! wrap assistant-observed text in a shape that superficially looks like a
//! role=user JSON record but never came from a human at the keyboard.

use serde_json::Value;

const EXCLUDED_KEYS: &[&str] = &["toolUseResult", "tool_result", "custom_tool_call_output"];

/// Parse one JSONL line and return the human-authored message text, if the
/// line represents a genuine user turn.
pub fn extract_user_message(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;

    if is_tool_result_context(&value) {
        return None;
    }

    let role = value.get("role").or_else(|| value.get("type"))?.as_str()?;
    if role != "user" && role != "human" {
        return None;
    }

    extract_text(&value)
}

fn is_tool_result_context(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    EXCLUDED_KEYS.iter().any(|key| map.contains_key(*key))
}

fn extract_text(value: &Value) -> Option<String> {
    if let Some(content) = value.get("content") {
        if let Some(text) = content.as_str() {
            return Some(text.to_string());
        }
        if let Some(parts) = content.as_array() {
            let joined: String = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if !joined.is_empty() {
                return Some(joined);
            }
        }
    }
    value.get("message").and_then(Value::as_str).map(str::to_string)
}

/// Fallback used when the agent's log format has no structured `content`
/// field (plain trace lines): take the line verbatim if it looks like a
/// human-typed command rather than a structured event.
pub fn trace_line_fallback(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('{') {
        return None;
    }
    Some(trimmed.to_string())
}
