//! Log-to-window matcher (§4.7): correlates a tmux window with the agent
//! log file it's driving by shelling out to ripgrep for the ordered set of
//! recent messages the window's pane shows were submitted.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::detector::trace_line_fallback;
use crate::logs::discovery::DiscoveredLog;

const RG_TIMEOUT: Duration = Duration::from_secs(3);
const MIN_MESSAGE_LEN: usize = 4;

/// JSON keys that mark a record as a tool-result echo rather than a genuine
/// user turn — a match on a line carrying one of these is never counted.
const TOOL_RESULT_MARKERS: &[&str] = &["tool_result", "toolUseResult", "custom_tool_call_output"];

#[derive(Clone, Debug, PartialEq)]
pub enum VerifyOutcome {
    Verified,
    Mismatch,
    Inconclusive,
}

/// One candidate window waiting to be matched to a log: the ordered recent
/// messages its pane shows were submitted (oldest first), plus a raw
/// trace-line fallback for agents whose pane has no recognizable glyph
/// convention to extract a structured message from.
#[derive(Clone, Debug, Default)]
pub struct WindowCandidate {
    pub tmux_target: String,
    pub submitted_messages: Vec<String>,
    pub fallback_trace_line: Option<String>,
}

/// Line numbers (1-based, as ripgrep reports them) where `needle` occurs in
/// `path` as a literal substring, excluding lines that also look like a
/// tool-result echo rather than a genuine user message. `threads` is
/// forwarded to ripgrep's `--threads`; 0 lets ripgrep pick its own default.
async fn matching_lines(path: &Path, needle: &str, threads: usize) -> Vec<usize> {
    if needle.trim().is_empty() {
        return Vec::new();
    }
    let _timer = crate::metrics::Timer::new(&crate::metrics::METRICS.rg_cmd);
    let mut cmd = Command::new("rg");
    cmd.arg("-F").arg("-n");
    if threads > 0 {
        cmd.arg("--threads").arg(threads.to_string());
    }
    cmd.arg("-e").arg(needle).arg(path);
    let Ok(Ok(output)) = timeout(RG_TIMEOUT, cmd.output()).await else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let (num, rest) = line.split_once(':')?;
            if TOOL_RESULT_MARKERS.iter().any(|marker| rest.contains(marker)) {
                return None;
            }
            num.parse::<usize>().ok()
        })
        .collect()
}

async fn rg_contains(path: &Path, needle: &str) -> bool {
    !matching_lines(path, needle, 1).await.is_empty()
}

/// A log matches a window's ordered messages when every message is found,
/// each at or after the line of the previous one. Returns the line of the
/// last matched message, used as the tiebreak key across candidate logs.
async fn messages_match_in_order(log: &DiscoveredLog, messages: &[&String], threads: usize) -> Option<usize> {
    let mut floor = 0usize;
    let mut last_line = 0usize;
    for message in messages {
        let candidate = matching_lines(&log.path, message, threads)
            .await
            .into_iter()
            .filter(|&line| line >= floor)
            .min()?;
        floor = candidate;
        last_line = candidate;
    }
    Some(last_line)
}

/// Bijective match: each window gets at most one log, each log gets at most
/// one window. Among logs that all satisfy a window's ordered messages,
/// ties are broken in favor of the log whose last matching line is
/// earliest — the candidate whose content most tightly accounts for
/// exactly what the window shows, per the tiebreak resolved in DESIGN.md.
pub async fn match_windows_to_logs_by_exact_rg(
    windows: &[WindowCandidate],
    logs: &[DiscoveredLog],
    rg_threads: usize,
) -> HashMap<String, String> {
    let mut claimed_logs: HashSet<usize> = HashSet::new();
    let mut result = HashMap::new();

    for window in windows {
        let messages: Vec<&String> = window
            .submitted_messages
            .iter()
            .filter(|m| m.trim().chars().count() >= MIN_MESSAGE_LEN)
            .collect();

        let mut best: Option<(usize, usize)> = None;
        if !messages.is_empty() {
            for (idx, log) in logs.iter().enumerate() {
                if claimed_logs.contains(&idx) {
                    continue;
                }
                if let Some(last_line) = messages_match_in_order(log, &messages, rg_threads).await {
                    if best.map_or(true, |(_, best_line)| last_line < best_line) {
                        best = Some((idx, last_line));
                    }
                }
            }
        } else if let Some(trace) = window.fallback_trace_line.as_deref().and_then(trace_line_fallback) {
            for (idx, log) in logs.iter().enumerate() {
                if claimed_logs.contains(&idx) {
                    continue;
                }
                if let Some(&first_line) = matching_lines(&log.path, &trace, rg_threads).await.first() {
                    if best.map_or(true, |(_, best_line)| first_line < best_line) {
                        best = Some((idx, first_line));
                    }
                }
            }
        }

        if let Some((idx, _)) = best {
            claimed_logs.insert(idx);
            result.insert(window.tmux_target.clone(), logs[idx].session_id.clone());
        }
    }

    result
}

/// Re-check an existing window/log pairing independently of the bijective
/// matcher, used at startup before trusting a persisted association.
pub async fn verify_window_log_association(
    last_submitted_message: &str,
    log: &DiscoveredLog,
) -> VerifyOutcome {
    if last_submitted_message.trim().is_empty() {
        return VerifyOutcome::Inconclusive;
    }
    if rg_contains(&log.path, last_submitted_message).await {
        VerifyOutcome::Verified
    } else {
        VerifyOutcome::Mismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;
    use std::fs;
    use tempfile::TempDir;

    fn write_log(dir: &TempDir, name: &str, content: &str) -> DiscoveredLog {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        DiscoveredLog {
            path,
            agent_type: AgentType::Claude,
            session_id: name.trim_end_matches(".jsonl").to_string(),
            modified_ms: 0,
        }
    }

    fn candidate(target: &str, messages: &[&str]) -> WindowCandidate {
        WindowCandidate {
            tmux_target: target.to_string(),
            submitted_messages: messages.iter().map(|m| m.to_string()).collect(),
            fallback_trace_line: None,
        }
    }

    #[tokio::test]
    async fn verify_returns_inconclusive_for_empty_message() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "s1.jsonl", "content");
        assert_eq!(
            verify_window_log_association("", &log).await,
            VerifyOutcome::Inconclusive
        );
    }

    #[tokio::test]
    async fn verify_matches_exact_content() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "s1.jsonl", r#"{"role":"user","content":"run the tests"}"#);
        assert_eq!(
            verify_window_log_association("run the tests", &log).await,
            VerifyOutcome::Verified
        );
    }

    #[tokio::test]
    async fn verify_flags_mismatch() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "s1.jsonl", r#"{"role":"user","content":"unrelated"}"#);
        assert_eq!(
            verify_window_log_association("run the tests", &log).await,
            VerifyOutcome::Mismatch
        );
    }

    #[tokio::test]
    async fn verify_ignores_tool_result_echo() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            "s1.jsonl",
            r#"{"role":"user","toolUseResult":{"stdout":"run the tests"}}"#,
        );
        assert_eq!(
            verify_window_log_association("run the tests", &log).await,
            VerifyOutcome::Mismatch
        );
    }

    #[tokio::test]
    async fn bijective_match_does_not_double_assign_a_log() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "s1.jsonl", r#"{"role":"user","content":"shared message"}"#);
        let windows = vec![
            candidate("a:1", &["shared message"]),
            candidate("a:2", &["shared message"]),
        ];
        let result = match_windows_to_logs_by_exact_rg(&windows, std::slice::from_ref(&log), 1).await;
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn multiple_messages_must_all_match_in_order() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            "s1.jsonl",
            "{\"role\":\"user\",\"content\":\"first message\"}\n{\"role\":\"assistant\",\"content\":\"ack\"}\n{\"role\":\"user\",\"content\":\"second message\"}\n",
        );
        let windows = vec![candidate("a:1", &["first message", "second message"])];
        let result = match_windows_to_logs_by_exact_rg(&windows, std::slice::from_ref(&log), 1).await;
        assert_eq!(result.get("a:1"), Some(&"s1".to_string()));
    }

    #[tokio::test]
    async fn out_of_order_messages_do_not_match() {
        let dir = TempDir::new().unwrap();
        let log = write_log(
            &dir,
            "s1.jsonl",
            "{\"role\":\"user\",\"content\":\"second message\"}\n{\"role\":\"user\",\"content\":\"first message\"}\n",
        );
        let windows = vec![candidate("a:1", &["first message", "second message"])];
        let result = match_windows_to_logs_by_exact_rg(&windows, std::slice::from_ref(&log), 1).await;
        assert!(result.get("a:1").is_none());
    }

    #[tokio::test]
    async fn bijective_matcher_distinguishes_similar_but_distinct_logs() {
        let dir = TempDir::new().unwrap();
        let log_a = write_log(&dir, "s1.jsonl", r#"{"role":"user","content":"refactor the parser"}"#);
        let log_b = write_log(
            &dir,
            "s2.jsonl",
            r#"{"role":"user","content":"refactor the parser more thoroughly"}"#,
        );
        let windows = vec![candidate("a:1", &["refactor the parser"])];
        let result = match_windows_to_logs_by_exact_rg(&windows, &[log_a.clone(), log_b.clone()], 1).await;
        assert_eq!(result.get("a:1"), Some(&"s1".to_string()));
    }

    #[tokio::test]
    async fn short_messages_are_skipped_as_unreliable() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "s1.jsonl", r#"{"role":"user","content":"ok"}"#);
        let windows = vec![candidate("a:1", &["ok"])];
        let result = match_windows_to_logs_by_exact_rg(&windows, std::slice::from_ref(&log), 1).await;
        assert!(result.get("a:1").is_none());
    }

    #[tokio::test]
    async fn trace_line_fallback_is_used_when_no_messages_detected() {
        let dir = TempDir::new().unwrap();
        let log = write_log(&dir, "s1.jsonl", "run the migration script now");
        let window = WindowCandidate {
            tmux_target: "a:1".to_string(),
            submitted_messages: Vec::new(),
            fallback_trace_line: Some("run the migration script now".to_string()),
        };
        let result = match_windows_to_logs_by_exact_rg(&[window], std::slice::from_ref(&log), 1).await;
        assert_eq!(result.get("a:1"), Some(&"s1".to_string()));
    }
}
