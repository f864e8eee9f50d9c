//! Log discovery (§4.6): enumerate agent conversation logs under the
//! Claude/Codex home directories so the poller knows what exists without
//! re-walking the filesystem on every tick.

use std::path::{Path, PathBuf};

use crate::error::DaemonResult;
use crate::models::AgentType;

#[derive(Clone, Debug)]
pub struct DiscoveredLog {
    pub path: PathBuf,
    pub agent_type: AgentType,
    pub session_id: String,
    pub modified_ms: i64,
}

/// Claude logs live at `<CLAUDE_CONFIG_DIR>/projects/<project>/<sessionId>.jsonl`.
pub fn claude_home() -> PathBuf {
    std::env::var_os("CLAUDE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_home().join(".claude"))
}

/// Codex logs live at `<CODEX_HOME>/sessions/**/rollout-*.jsonl`.
pub fn codex_home() -> PathBuf {
    std::env::var_os("CODEX_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_home().join(".codex"))
}

fn default_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Codex subagent transcripts are nested rollout files spawned by a parent
/// session; they share the parent's content but aren't independently
/// resumable, so the matcher and the UI both exclude them.
fn is_codex_subagent_log(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "subagents")
}

pub fn discover_claude_logs() -> DaemonResult<Vec<DiscoveredLog>> {
    discover_jsonl(&claude_home().join("projects"), AgentType::Claude, |_| true)
}

pub fn discover_codex_logs() -> DaemonResult<Vec<DiscoveredLog>> {
    discover_jsonl(&codex_home().join("sessions"), AgentType::Codex, |p| {
        !is_codex_subagent_log(p)
    })
}

fn discover_jsonl(
    root: &Path,
    agent_type: AgentType,
    keep: impl Fn(&Path) -> bool,
) -> DaemonResult<Vec<DiscoveredLog>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    walk(root, &mut |path| {
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            return;
        }
        if !keep(path) {
            return;
        }
        let Some(session_id) = session_id_from_path(path) else {
            return;
        };
        let modified_ms = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|dur| dur.as_millis() as i64)
            .unwrap_or(0);
        out.push(DiscoveredLog {
            path: path.to_path_buf(),
            agent_type,
            session_id,
            modified_ms,
        });
    });
    Ok(out)
}

fn session_id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    Some(stem.strip_prefix("rollout-").unwrap_or(stem).to_string())
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn session_id_extracted_from_plain_filename() {
        let path = PathBuf::from("/x/abc-123.jsonl");
        assert_eq!(session_id_from_path(&path).as_deref(), Some("abc-123"));
    }

    #[test]
    fn session_id_strips_rollout_prefix() {
        let path = PathBuf::from("/x/rollout-abc-123.jsonl");
        assert_eq!(session_id_from_path(&path).as_deref(), Some("abc-123"));
    }

    #[test]
    fn subagent_log_detected_by_path_component() {
        let path = PathBuf::from("/home/u/.codex/sessions/subagents/abc.jsonl");
        assert!(is_codex_subagent_log(&path));
    }

    #[test]
    fn discover_jsonl_finds_nested_files() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("proj1");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("sess1.jsonl"), "{}").unwrap();
        fs::write(nested.join("ignore.txt"), "{}").unwrap();

        let logs = discover_jsonl(temp.path(), AgentType::Claude, |_| true).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].session_id, "sess1");
    }

    #[test]
    fn discover_jsonl_missing_root_returns_empty() {
        let logs = discover_jsonl(Path::new("/nonexistent/path"), AgentType::Claude, |_| true).unwrap();
        assert!(logs.is_empty());
    }
}
