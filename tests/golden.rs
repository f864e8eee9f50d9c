//! Scripted walks through the pure detector pipeline against literal
//! transcript fixtures, mirroring a real scan/poll sequence end to end
//! without a live tmux server or log files on disk.

use agentboard::detector::{infer_agent_type, infer_session_status, StatusConfig, StatusInput};
use agentboard::logs::matcher::{match_windows_to_logs_by_exact_rg, WindowCandidate};
use agentboard::models::{AgentType, SessionStatus};

struct Tick<'a> {
    capture: &'a str,
    expected_status: SessionStatus,
    expected_reason: &'a str,
}

/// A Claude window working through a permission prompt and back to idle,
/// replayed tick-by-tick through `infer_session_status` the way the tmux
/// scanner would call it once per poll.
#[test]
fn claude_permission_prompt_round_trip() {
    let dims = (80, 24);
    let ticks = [
        Tick {
            capture: "$ claude\nWelcome to Claude Code",
            expected_status: SessionStatus::Waiting,
            expected_reason: "initial-observation",
        },
        Tick {
            capture: "Running tool: edit_file src/main.rs",
            expected_status: SessionStatus::Working,
            expected_reason: "output-changed",
        },
        Tick {
            capture: "This command will delete 3 files.\nDo you want to proceed? (y/n)",
            expected_status: SessionStatus::Working,
            expected_reason: "output-changed",
        },
        Tick {
            capture: "This command will delete 3 files.\nDo you want to proceed? (y/n)",
            expected_status: SessionStatus::Permission,
            expected_reason: "permission-prompt",
        },
        Tick {
            capture: "Deleted 3 files.\n$ ",
            expected_status: SessionStatus::Working,
            expected_reason: "output-changed",
        },
    ];

    let mut prev: Option<String> = None;
    let mut grace_started_at_ms: Option<i64> = None;

    for (idx, tick) in ticks.iter().enumerate() {
        let now_ms = 1_700_000_000_000 + idx as i64 * 1000;
        let input = StatusInput {
            prev_capture: prev.as_deref(),
            prev_dims: prev.as_ref().map(|_| dims),
            next_capture: tick.capture,
            next_dims: dims,
            grace_started_at_ms,
            now_ms,
        };
        let result = infer_session_status(input, StatusConfig::default());
        assert_eq!(
            result.status, tick.expected_status,
            "tick {idx}: expected status {:?}, got {:?}",
            tick.expected_status, result.status
        );
        assert_eq!(result.reason, tick.expected_reason, "tick {idx}: reason mismatch");

        grace_started_at_ms = result.grace_started_at_ms;
        prev = Some(tick.capture.to_string());
    }
}

/// Agent-type inference across the realistic variety of start commands a
/// tmux `pane_start_command` can actually report, including wrapper
/// binaries and login-shell indirection.
#[test]
fn agent_type_inference_across_start_command_variants() {
    let cases: &[(&str, AgentType)] = &[
        ("claude", AgentType::Claude),
        ("/usr/local/bin/claude --resume abc123", AgentType::Claude),
        ("npx claude-code", AgentType::Unknown),
        ("codex", AgentType::Codex),
        ("pnpm exec codex --search", AgentType::Unknown),
        ("bash -lic 'cd /repo && codex resume abc'", AgentType::Unknown),
        ("bash -lic 'codex resume abc'", AgentType::Codex),
        ("pi --model sonnet", AgentType::Pi),
        ("vim", AgentType::Unknown),
        ("", AgentType::Unknown),
    ];

    for (command, expected) in cases {
        assert_eq!(
            infer_agent_type(command),
            *expected,
            "command {command:?} should infer {expected:?}"
        );
    }
}

/// Two windows whose pane tails both end in the same line, matched
/// bijectively against two genuinely distinct log files — only the window
/// whose message actually occurs in a given log should claim it.
#[tokio::test]
async fn bijective_matcher_distinguishes_similar_but_distinct_logs() {
    let dir = tempfile::TempDir::new().unwrap();
    let claude_log = dir.path().join("claude-session.jsonl");
    let codex_log = dir.path().join("codex-session.jsonl");
    std::fs::write(
        &claude_log,
        r#"{"role":"user","content":"refactor the parser"}"#,
    )
    .unwrap();
    std::fs::write(
        &codex_log,
        r#"{"role":"user","content":"add a retry to the uploader"}"#,
    )
    .unwrap();

    let logs = vec![
        agentboard::logs::discovery::DiscoveredLog {
            path: claude_log,
            agent_type: AgentType::Claude,
            session_id: "claude-session".to_string(),
            modified_ms: 1000,
        },
        agentboard::logs::discovery::DiscoveredLog {
            path: codex_log,
            agent_type: AgentType::Codex,
            session_id: "codex-session".to_string(),
            modified_ms: 2000,
        },
    ];

    let windows = vec![
        WindowCandidate {
            tmux_target: "agentboard:@1".to_string(),
            submitted_messages: vec!["refactor the parser".to_string()],
            fallback_trace_line: None,
        },
        WindowCandidate {
            tmux_target: "agentboard:@2".to_string(),
            submitted_messages: vec!["add a retry to the uploader".to_string()],
            fallback_trace_line: None,
        },
    ];

    let matches = match_windows_to_logs_by_exact_rg(&windows, &logs, 1).await;
    assert_eq!(matches.get("agentboard:@1").map(String::as_str), Some("claude-session"));
    assert_eq!(matches.get("agentboard:@2").map(String::as_str), Some("codex-session"));
}
