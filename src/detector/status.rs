//! Session status inference (§4.3): a pure function over two successive
//! pane captures. No I/O, no clocks of its own — every timestamp is passed
//! in so the rule order is exactly reproducible in tests.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::SessionStatus;

const CHANGE_RATIO_THRESHOLD: f64 = 0.9;
const TOKEN_COUNT_FLOOR: usize = 8;

static PERMISSION_PATTERNS: &[&str] = &[
    r"(?i)do you want to proceed",
    r"(?i)do you want to",
    r"\(y/n\)",
    r"(?i)\by/n\b",
    r"(?mi)^\s*[❯>]?\s*1\.\s*yes\b",
    r"(?i)press enter to continue",
    r"(?i)waiting for (your )?approval",
    r"(?mi)^\s*esc to (cancel|interrupt)\b",
];

static NOISE_LINE_PATTERNS: &[&str] = &[
    r"(?i)%\s*context left",
    r"(?i)background terminal running",
    r"(?i)esc to interrupt",
];

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap())
}

fn timer_glyph_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]").unwrap())
}

fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

#[derive(Clone, Debug)]
pub struct StatusInput<'a> {
    pub prev_capture: Option<&'a str>,
    pub prev_dims: Option<(u16, u16)>,
    pub next_capture: &'a str,
    pub next_dims: (u16, u16),
    /// Epoch millis the current "working" run started, if any — carried
    /// forward by the caller across polls.
    pub grace_started_at_ms: Option<i64>,
    pub now_ms: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct StatusConfig {
    pub working_grace_period_ms: i64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            working_grace_period_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatusResult {
    pub status: SessionStatus,
    pub reason: String,
    /// Updated grace-period anchor to persist for the next call.
    pub grace_started_at_ms: Option<i64>,
}

pub fn infer_session_status(input: StatusInput<'_>, config: StatusConfig) -> StatusResult {
    let Some(prev) = input.prev_capture else {
        return StatusResult {
            status: SessionStatus::Waiting,
            reason: "initial-observation".to_string(),
            grace_started_at_ms: None,
        };
    };

    let changed = capture_changed(prev, input.prev_dims, input.next_capture, input.next_dims);

    if changed {
        return StatusResult {
            status: SessionStatus::Working,
            reason: "output-changed".to_string(),
            grace_started_at_ms: Some(input.now_ms),
        };
    }

    if matches_permission_pattern(input.next_capture) {
        return StatusResult {
            status: SessionStatus::Permission,
            reason: "permission-prompt".to_string(),
            grace_started_at_ms: input.grace_started_at_ms,
        };
    }

    if let Some(started) = input.grace_started_at_ms {
        if input.now_ms.saturating_sub(started) < config.working_grace_period_ms {
            return StatusResult {
                status: SessionStatus::Working,
                reason: "working-grace-period".to_string(),
                grace_started_at_ms: Some(started),
            };
        }
    }

    StatusResult {
        status: SessionStatus::Waiting,
        reason: "idle-output".to_string(),
        grace_started_at_ms: input.grace_started_at_ms,
    }
}

/// Same-dimension captures are compared byte-for-byte; tmux never rewraps
/// lines unless the pane is resized, so any difference there is real. A
/// resize invalidates that exact comparison, so instead we normalize both
/// captures into comparable line sets and compare token overlap.
fn capture_changed(prev: &str, prev_dims: Option<(u16, u16)>, next: &str, next_dims: (u16, u16)) -> bool {
    if prev_dims == Some(next_dims) {
        return prev != next;
    }

    let prev_lines = normalize_capture(prev);
    let next_lines = normalize_capture(next);
    let prev_tokens: HashSet<&str> = prev_lines.iter().flat_map(|l| l.split_whitespace()).collect();
    let next_tokens: HashSet<&str> = next_lines.iter().flat_map(|l| l.split_whitespace()).collect();

    let larger = prev_tokens.len().max(next_tokens.len());
    if larger < TOKEN_COUNT_FLOOR {
        return true;
    }

    let intersection = prev_tokens.intersection(&next_tokens).count();
    let ratio_prev = intersection as f64 / prev_tokens.len() as f64;
    let ratio_next = intersection as f64 / next_tokens.len() as f64;
    let ratio_min = ratio_prev.min(ratio_next);

    ratio_min < CHANGE_RATIO_THRESHOLD
}

/// Strip ANSI escapes, drop border/metadata noise lines and timer glyphs,
/// collapse whitespace, and keep only the tail of the pane — the part a
/// resize-induced rewrap actually disturbs.
fn normalize_capture(capture: &str) -> Vec<String> {
    const KEEP_LAST: usize = 20;
    let stripped = strip_ansi(capture);
    let noise: Vec<Regex> = NOISE_LINE_PATTERNS.iter().map(|p| Regex::new(p).unwrap()).collect();

    let mut lines = Vec::new();
    for line in stripped.lines() {
        if noise.iter().any(|re| re.is_match(line)) {
            continue;
        }
        let cleaned = timer_glyph_regex().replace_all(line, "");
        let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        lines.push(collapsed);
    }

    let start = lines.len().saturating_sub(KEEP_LAST);
    lines[start..].to_vec()
}

fn matches_permission_pattern(capture: &str) -> bool {
    let stripped = strip_ansi(capture);
    let mut lines: Vec<&str> = stripped
        .lines()
        .rev()
        .skip_while(|l| l.trim().is_empty())
        .take(10)
        .collect();
    lines.reverse();
    let tail = lines.join("\n");
    PERMISSION_PATTERNS.iter().any(|pattern| {
        Regex::new(pattern).map(|re| re.is_match(&tail)).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(now_ms: i64) -> StatusInput<'static> {
        StatusInput {
            prev_capture: Some("idle prompt >"),
            prev_dims: Some((80, 24)),
            next_capture: "idle prompt >",
            next_dims: (80, 24),
            grace_started_at_ms: None,
            now_ms,
        }
    }

    #[test]
    fn initial_observation_is_waiting() {
        let input = StatusInput {
            prev_capture: None,
            prev_dims: None,
            next_capture: "whatever",
            next_dims: (80, 24),
            grace_started_at_ms: None,
            now_ms: 0,
        };
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Waiting);
        assert_eq!(result.reason, "initial-observation");
    }

    #[test]
    fn changed_output_wins_as_working() {
        let mut input = base(1000);
        input.next_capture = "new output appeared";
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Working);
        assert_eq!(result.grace_started_at_ms, Some(1000));
    }

    #[test]
    fn unchanged_output_with_permission_pattern() {
        let mut input = base(1000);
        input.prev_capture = Some("Do you want to proceed? (y/n)");
        input.next_capture = "Do you want to proceed? (y/n)";
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Permission);
    }

    #[test]
    fn permission_prompt_golden_example_matches() {
        assert!(matches_permission_pattern("some tool output\n❯ 1. Yes\n2. No\nEsc to cancel"));
    }

    #[test]
    fn permission_prose_mentioning_allow_does_not_match() {
        assert!(!matches_permission_pattern(
            "1. Allow new contributors to access repo\n2. Review open PRs"
        ));
    }

    #[test]
    fn unchanged_output_within_grace_period_stays_working() {
        let mut input = base(5_000);
        input.grace_started_at_ms = Some(1_000);
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Working);
        assert_eq!(result.reason, "working-grace-period");
    }

    #[test]
    fn unchanged_output_past_grace_period_is_waiting() {
        let mut input = base(20_000);
        input.grace_started_at_ms = Some(1_000);
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Waiting);
        assert_eq!(result.reason, "idle-output");
    }

    #[test]
    fn unchanged_output_with_no_grace_anchor_is_waiting() {
        let input = base(1000);
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Waiting);
    }

    #[test]
    fn resize_with_high_overlap_is_not_changed() {
        let long_line = (0..10).map(|i| format!("token{i}")).collect::<Vec<_>>().join(" ");
        let mut input = base(1000);
        input.prev_capture = Some(&long_line);
        input.prev_dims = Some((80, 24));
        input.next_capture = &long_line;
        input.next_dims = (100, 24);
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Waiting);
    }

    #[test]
    fn resize_with_low_overlap_is_changed() {
        let prev = (0..10).map(|i| format!("aaa{i}")).collect::<Vec<_>>().join(" ");
        let next = (0..10).map(|i| format!("zzz{i}")).collect::<Vec<_>>().join(" ");
        let mut input = base(1000);
        input.prev_capture = Some(&prev);
        input.prev_dims = Some((80, 24));
        input.next_capture = &next;
        input.next_dims = (100, 24);
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Working);
    }

    #[test]
    fn resize_below_token_floor_is_always_changed() {
        let mut input = base(1000);
        input.prev_capture = Some("a b");
        input.prev_dims = Some((80, 24));
        input.next_capture = "a b";
        input.next_dims = (100, 24);
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(result.status, SessionStatus::Working);
        assert_eq!(result.reason, "output-changed");
    }

    #[test]
    fn normalize_capture_drops_noise_lines_and_ansi() {
        let raw = "\x1b[1mhello world\x1b[0m\n42% context left\nbackground terminal running\nsecond line";
        let normalized = normalize_capture(raw);
        assert_eq!(normalized, vec!["hello world".to_string(), "second line".to_string()]);
    }

    #[test]
    fn default_grace_period() {
        assert_eq!(StatusConfig::default().working_grace_period_ms, 10_000);
    }
}
