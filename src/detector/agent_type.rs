//! Agent-type inference from a pane's start command (§4.4). Unlike the
//! output-pattern matching used for status, this is a pure token parse: no
//! regexes, no pane content, just the command tmux reports it launched.

use crate::models::AgentType;

const WRAPPERS: &[&str] = &["npx", "bunx", "pnpm", "yarn", "env"];
const KNOWN_AGENTS: &[(&str, AgentType)] = &[
    ("claude", AgentType::Claude),
    ("codex", AgentType::Codex),
    ("pi", AgentType::Pi),
];

/// Infer the agent type from the raw command tmux reports for a pane
/// (`pane_start_command` / `#{pane_start_command}`).
pub fn infer_agent_type(start_command: &str) -> AgentType {
    let unwrapped = unquote(start_command.trim());

    if let Some(inner) = login_shell_inner(unwrapped) {
        return infer_agent_type(inner);
    }

    let tokens: Vec<&str> = unwrapped.split_whitespace().collect();
    for token in tokens {
        let lowered = token.to_ascii_lowercase();
        if WRAPPERS.contains(&lowered.as_str()) {
            continue;
        }
        if token.contains('=') {
            continue;
        }
        if token.starts_with('-') {
            continue;
        }
        let base = basename(&lowered);
        return KNOWN_AGENTS
            .iter()
            .find(|(name, _)| *name == base)
            .map(|(_, agent)| *agent)
            .unwrap_or(AgentType::Unknown);
    }

    AgentType::Unknown
}

/// Strip a single layer of surrounding matching quotes, if present.
fn unquote(input: &str) -> &str {
    let bytes = input.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &input[1..input.len() - 1];
        }
    }
    input
}

/// Detect a `bash -lic '<cmd>'` or `bash -lc '<cmd>'` login-shell wrapper and
/// return the inner command to recurse on.
fn login_shell_inner(input: &str) -> Option<&str> {
    let rest = input
        .strip_prefix("bash -lic ")
        .or_else(|| input.strip_prefix("bash -lc "))
        .or_else(|| input.strip_prefix("/bin/bash -lic "))
        .or_else(|| input.strip_prefix("/bin/bash -lc "))?;
    Some(unquote(rest.trim()))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_with_flag() {
        assert_eq!(infer_agent_type("codex --search"), AgentType::Codex);
    }

    #[test]
    fn claude_absolute_path() {
        assert_eq!(infer_agent_type("/usr/local/bin/claude"), AgentType::Claude);
    }

    #[test]
    fn claude_with_env_assignment_prefix() {
        assert_eq!(infer_agent_type("ENV_VAR=1 claude"), AgentType::Claude);
    }

    #[test]
    fn codex_via_npx() {
        assert_eq!(infer_agent_type("npx codex"), AgentType::Codex);
    }

    #[test]
    fn claude_inside_login_shell_wrapper() {
        assert_eq!(
            infer_agent_type("bash -lic 'claude --resume abc'"),
            AgentType::Claude
        );
    }

    #[test]
    fn bare_bash_is_unknown() {
        assert_eq!(infer_agent_type("bash"), AgentType::Unknown);
    }

    #[test]
    fn quoted_whole_command() {
        assert_eq!(infer_agent_type("'codex --search'"), AgentType::Codex);
    }

    #[test]
    fn pi_detected() {
        assert_eq!(infer_agent_type("pi --model sonnet"), AgentType::Pi);
    }

    #[test]
    fn multiple_env_assignments_skipped() {
        assert_eq!(infer_agent_type("A=1 B=2 claude"), AgentType::Claude);
    }

    #[test]
    fn unrelated_binary_is_unknown() {
        assert_eq!(infer_agent_type("vim notes.txt"), AgentType::Unknown);
    }

    #[test]
    fn empty_command_is_unknown() {
        assert_eq!(infer_agent_type(""), AgentType::Unknown);
    }
}
