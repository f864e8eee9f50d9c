//! Log poller (§4.8): the serial background loop that keeps `agent_sessions`
//! rows fresh — discovers logs, rematches them against live windows, and
//! persists the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::bus::{DaemonEvent, DaemonEventType, EventBus};
use crate::db;
use crate::error::DaemonResult;
use crate::logs::discovery::{discover_claude_logs, discover_codex_logs, DiscoveredLog};
use crate::logs::matcher::{match_windows_to_logs_by_exact_rg, WindowCandidate};
use crate::models::AgentSession;

const LAST_USER_MESSAGE_LOCK_MS: i64 = 60_000;

#[derive(Clone, Debug)]
pub struct LogPollerConfig {
    pub interval_ms: u64,
    /// Maximum number of discovered logs considered in a single tick.
    pub poll_max: usize,
    /// Threads ripgrep is allowed to use per invocation.
    pub rg_threads: usize,
}

impl Default for LogPollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            poll_max: 25,
            rg_threads: 1,
        }
    }
}

pub struct LogPoller {
    config: LogPollerConfig,
    conn: Arc<Mutex<Connection>>,
    bus: Arc<EventBus>,
    /// session_id -> epoch ms until which an externally-set lastUserMessage
    /// must not be overwritten by a rematch.
    locked_until_ms: HashMap<String, i64>,
}

impl LogPoller {
    pub fn new(config: LogPollerConfig, conn: Arc<Mutex<Connection>>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            conn,
            bus,
            locked_until_ms: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    pub fn lock_last_user_message(&mut self, session_id: &str, now_ms: i64) {
        self.locked_until_ms
            .insert(session_id.to_string(), now_ms + LAST_USER_MESSAGE_LOCK_MS);
    }

    fn is_locked(&self, session_id: &str, now_ms: i64) -> bool {
        self.locked_until_ms
            .get(session_id)
            .map(|until| now_ms < *until)
            .unwrap_or(false)
    }

    /// A log is worth rematching only if it might change an existing
    /// association: its session is unknown to us, its row has no current
    /// window, or it has been written to more recently than the row's
    /// stored `lastActivityAt`. Everything else is already settled.
    fn needs_matching(log: &DiscoveredLog, existing: Option<&AgentSession>) -> bool {
        match existing {
            None => true,
            Some(row) => {
                row.current_window.is_none() || log.modified_ms > iso_to_epoch_ms(&row.last_activity_at)
            }
        }
    }

    /// One poll cycle: discover logs, match against live windows, commit.
    /// `windows` is the current set of candidate (tmux_target, recent
    /// submitted messages) pairs supplied by the reconciler.
    pub async fn tick(
        &mut self,
        windows: &[WindowCandidate],
        now_iso: &str,
        now_ms: i64,
    ) -> DaemonResult<usize> {
        let mut logs = discover_claude_logs()?;
        logs.extend(discover_codex_logs()?);
        logs.sort_by_key(|l| std::cmp::Reverse(l.modified_ms));
        logs.truncate(self.config.poll_max.max(1));

        let conn = self.conn.lock().await;
        let existing_by_session: HashMap<String, AgentSession> = db::list_agent_sessions(&conn)?
            .into_iter()
            .map(|row| (row.session_id.clone(), row))
            .collect();
        drop(conn);

        let candidate_logs: Vec<DiscoveredLog> = logs
            .into_iter()
            .filter(|log| Self::needs_matching(log, existing_by_session.get(&log.session_id)))
            .collect();

        let matches = match_windows_to_logs_by_exact_rg(windows, &candidate_logs, self.config.rg_threads).await;
        let mut committed = 0;

        let conn = self.conn.lock().await;
        let log_by_session: HashMap<&str, &DiscoveredLog> =
            candidate_logs.iter().map(|l| (l.session_id.as_str(), l)).collect();

        for (tmux_target, session_id) in &matches {
            let Some(log) = log_by_session.get(session_id.as_str()) else {
                continue;
            };

            let existing = db::get_agent_session(&conn, session_id)?;
            let mut row = existing.unwrap_or_else(|| {
                AgentSession::new(session_id.clone(), log.agent_type, log.path.display().to_string(), now_iso)
            });

            let was_orphaned = row.current_window.is_none();
            row.current_window = Some(tmux_target.clone());
            row.last_activity_at = last_entry_timestamp(&log.path).unwrap_or_else(|| now_iso.to_string());

            if !self.is_locked(session_id, now_ms) {
                if let Some(window) = windows.iter().find(|w| &w.tmux_target == tmux_target) {
                    if let Some(latest) = window.submitted_messages.last() {
                        if !latest.trim().is_empty() {
                            row.last_user_message = Some(latest.clone());
                        }
                    }
                }
            }

            db::upsert_agent_session(&conn, &row)?;
            committed += 1;

            if was_orphaned {
                let _ = self.bus.publish_event(DaemonEvent {
                    event_type: DaemonEventType::SessionActivated,
                    session_id: Some(session_id.clone()),
                    detected_at: now_iso.to_string(),
                    payload: None,
                });
            }
        }

        // Any row that thinks it's attached to a window that didn't get
        // rematched this tick is now orphaned.
        let matched_targets: std::collections::HashSet<&String> = matches.keys().collect();
        for mut row in db::list_agent_sessions(&conn)? {
            let Some(window) = row.current_window.clone() else {
                continue;
            };
            if !windows.iter().any(|w| w.tmux_target == window) || !matched_targets.contains(&row.session_id) {
                row.current_window = None;
                db::upsert_agent_session(&conn, &row)?;
                let _ = self.bus.publish_event(DaemonEvent {
                    event_type: DaemonEventType::SessionOrphaned,
                    session_id: Some(row.session_id.clone()),
                    detected_at: now_iso.to_string(),
                    payload: None,
                });
            }
        }

        Ok(committed)
    }
}

fn iso_to_epoch_ms(iso: &str) -> i64 {
    DateTime::parse_from_rfc3339(iso).map(|dt| dt.timestamp_millis()).unwrap_or(0)
}

/// Scan a log backwards for the last `"timestamp"` field rather than
/// trusting when we happened to poll — the log's own clock is the source of
/// truth for `lastActivityAt`.
fn last_entry_timestamp(path: &std::path::Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            continue;
        };
        if let Some(ts) = value.get("timestamp").and_then(|v| v.as_str()) {
            return Some(ts.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate;

    fn shared_conn() -> Arc<Mutex<Connection>> {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[test]
    fn lock_prevents_overwrite_within_window() {
        let mut poller = LogPoller::new(LogPollerConfig::default(), shared_conn(), Arc::new(EventBus::new(4)));
        poller.lock_last_user_message("s1", 1_000);
        assert!(poller.is_locked("s1", 1_000 + 59_000));
        assert!(!poller.is_locked("s1", 1_000 + 61_000));
    }

    #[tokio::test]
    async fn tick_with_no_logs_commits_nothing() {
        let mut poller = LogPoller::new(LogPollerConfig::default(), shared_conn(), Arc::new(EventBus::new(4)));
        let committed = poller.tick(&[], "2026-01-01T00:00:00Z", 0).await.unwrap();
        assert_eq!(committed, 0);
    }

    #[test]
    fn needs_matching_is_true_for_unknown_session() {
        let log = DiscoveredLog {
            path: "/tmp/x.jsonl".into(),
            agent_type: crate::models::AgentType::Claude,
            session_id: "s1".to_string(),
            modified_ms: 1000,
        };
        assert!(LogPoller::needs_matching(&log, None));
    }

    #[test]
    fn needs_matching_is_false_for_settled_row() {
        let log = DiscoveredLog {
            path: "/tmp/x.jsonl".into(),
            agent_type: crate::models::AgentType::Claude,
            session_id: "s1".to_string(),
            modified_ms: 1_700_000_000_000,
        };
        let mut row = AgentSession::new(
            "s1".to_string(),
            crate::models::AgentType::Claude,
            "/tmp/x.jsonl".to_string(),
            "2023-11-14T00:00:00Z",
        );
        row.current_window = Some("a:1".to_string());
        row.last_activity_at = "2025-01-01T00:00:00Z".to_string();
        assert!(!LogPoller::needs_matching(&log, Some(&row)));
    }

    #[test]
    fn needs_matching_is_true_when_orphaned_even_if_not_newer() {
        let log = DiscoveredLog {
            path: "/tmp/x.jsonl".into(),
            agent_type: crate::models::AgentType::Claude,
            session_id: "s1".to_string(),
            modified_ms: 0,
        };
        let row = AgentSession::new(
            "s1".to_string(),
            crate::models::AgentType::Claude,
            "/tmp/x.jsonl".to_string(),
            "2023-11-14T00:00:00Z",
        );
        assert!(LogPoller::needs_matching(&log, Some(&row)));
    }

    #[test]
    fn last_entry_timestamp_scans_from_the_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(
            &path,
            "{\"timestamp\":\"2026-01-01T00:00:00Z\"}\n{\"timestamp\":\"2026-01-01T00:05:00Z\"}\n",
        )
        .unwrap();
        assert_eq!(last_entry_timestamp(&path), Some("2026-01-01T00:05:00Z".to_string()));
    }

    #[test]
    fn last_entry_timestamp_is_none_without_timestamp_field() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, "{\"role\":\"user\"}\n").unwrap();
        assert_eq!(last_entry_timestamp(&path), None);
    }
}
