//! User-message extraction from raw tmux scrollback (§4.5). Unlike
//! `user_message`, which parses structured JSONL log lines, this module
//! works on the pane's literal rendered text — the Claude/Codex/Pi prompt
//! conventions each agent CLI draws on screen.

const PI_MESSAGE_BG_ON: &str = "\x1b[48;2;52;53;65m";
const PI_MESSAGE_BG_OFF: &str = "\x1b[0m";
const PENDING_SEND_WINDOW: usize = 3;

const TOOL_NOTIFICATION_MARKERS: &[&str] = &["<task-notification>", "<task-id>", "<instructions>"];

fn looks_like_tool_notification(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with("Warning:") && trimmed.contains("was requested via exec_command") {
        return true;
    }
    TOOL_NOTIFICATION_MARKERS.iter().any(|marker| trimmed.contains(marker))
}

/// Extract up to `limit` most-recent genuine user messages from one pane
/// capture, trying each agent CLI's rendering convention in turn.
pub fn extract_recent_user_messages(capture: &str, limit: usize) -> Vec<String> {
    let mut messages = extract_pi_messages(capture);
    if messages.is_empty() {
        messages = extract_claude_messages(capture);
    }
    if messages.is_empty() {
        messages = extract_codex_messages(capture);
    }

    messages.retain(|m| !m.trim().is_empty() && !looks_like_tool_notification(m));
    let start = messages.len().saturating_sub(limit);
    messages[start..].to_vec()
}

/// Claude style: lines starting with a prompt glyph (`❯` or `> `). The
/// bottom-most glyph line is excluded if it's still pending submission
/// (recognized by an `↵ send` hint within the next few lines).
fn extract_claude_messages(capture: &str) -> Vec<String> {
    let lines: Vec<&str> = capture.lines().collect();
    let mut glyph_indices = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if let Some(text) = trimmed.strip_prefix('❯') {
            glyph_indices.push((idx, text.trim().to_string()));
        } else if let Some(text) = trimmed.strip_prefix("> ") {
            glyph_indices.push((idx, text.trim().to_string()));
        }
    }

    if let Some(&(last_idx, _)) = glyph_indices.last() {
        let window_end = (last_idx + PENDING_SEND_WINDOW).min(lines.len().saturating_sub(1));
        let pending = lines[last_idx..=window_end].iter().any(|l| l.contains("↵ send") || l.contains("send"));
        if pending {
            glyph_indices.pop();
        }
    }

    glyph_indices.into_iter().map(|(_, text)| text).filter(|t| !t.is_empty()).collect()
}

/// Codex style: `›`-prefixed lines are input-field hints, never submitted
/// messages, so there's nothing to extract from the pane itself.
fn extract_codex_messages(capture: &str) -> Vec<String> {
    capture
        .lines()
        .filter(|line| !line.trim_start().starts_with('›'))
        .filter(|line| line.trim_start().starts_with('❯') || line.trim_start().starts_with("> "))
        .map(|line| {
            let trimmed = line.trim_start();
            trimmed.strip_prefix('❯').or_else(|| trimmed.strip_prefix(">")).unwrap_or(trimmed).trim().to_string()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Pi style: a message is delimited by the RGB(52,53,65) background
/// enable/disable escape sequence pair.
fn extract_pi_messages(capture: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = capture;
    while let Some(start) = rest.find(PI_MESSAGE_BG_ON) {
        let after_start = &rest[start + PI_MESSAGE_BG_ON.len()..];
        let Some(end) = after_start.find(PI_MESSAGE_BG_OFF) else {
            break;
        };
        let text = after_start[..end].trim().to_string();
        if !text.is_empty() {
            out.push(text);
        }
        rest = &after_start[end + PI_MESSAGE_BG_OFF.len()..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_extracts_submitted_message_excluding_pending() {
        let capture = "❯ refactor the parser\nassistant output here\n❯ still typing\n↵ send";
        let messages = extract_recent_user_messages(capture, 5);
        assert_eq!(messages, vec!["refactor the parser".to_string()]);
    }

    #[test]
    fn claude_keeps_last_message_when_not_pending() {
        let capture = "❯ refactor the parser\nassistant reply\n❯ run the tests\nassistant still replying";
        let messages = extract_recent_user_messages(capture, 5);
        assert_eq!(messages, vec!["refactor the parser".to_string(), "run the tests".to_string()]);
    }

    #[test]
    fn codex_hint_lines_are_ignored() {
        let capture = "› type your message here\nassistant reply";
        let messages = extract_recent_user_messages(capture, 5);
        assert!(messages.is_empty());
    }

    #[test]
    fn pi_extracts_text_between_background_sequences() {
        let capture = format!("{}add a retry to the uploader{}\nassistant reply", PI_MESSAGE_BG_ON, PI_MESSAGE_BG_OFF);
        let messages = extract_recent_user_messages(&capture, 5);
        assert_eq!(messages, vec!["add a retry to the uploader".to_string()]);
    }

    #[test]
    fn tool_notifications_are_never_returned() {
        let capture = "❯ Warning: foo was requested via exec_command\n❯ <task-notification>ping</task-notification>";
        let messages = extract_recent_user_messages(capture, 5);
        assert!(messages.is_empty());
    }

    #[test]
    fn limit_keeps_only_most_recent() {
        let capture = "❯ first\nx\n❯ second\nx\n❯ third\nx\n❯ fourth\nx";
        let messages = extract_recent_user_messages(capture, 2);
        assert_eq!(messages, vec!["third".to_string(), "fourth".to_string()]);
    }
}
