//! Session fusion & hydration (§4.9), pinned-session resurrection (§4.10),
//! and force-working overrides (§4.12). Sits between the scanners/registry
//! and the DB: takes one scanner tick's `Session`s plus the persisted
//! `AgentSession` rows and produces the fused view the registry publishes,
//! reconciling orphaned associations and live overrides along the way.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;

use crate::bus::{DaemonEvent, DaemonEventType, EventBus};
use crate::db;
use crate::error::DaemonResult;
use crate::logs::discovery::DiscoveredLog;
use crate::logs::matcher::{verify_window_log_association, VerifyOutcome};
use crate::models::{AgentSession, AgentType, Session, SessionStatus};

/// A session as handed to clients: the live tmux view enriched with
/// whatever persistent agent-session record is attached to its window.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedSession {
    #[serde(flatten)]
    pub session: Session,
    pub agent_session_id: Option<String>,
    pub agent_session_name: Option<String>,
    pub log_file_path: Option<String>,
    pub last_user_message: Option<String>,
    pub is_pinned: bool,
}

/// Attach each scanner-reported window to the `AgentSession` row whose
/// `currentWindow` names it, preferring the agent session's own timestamps
/// over the tmux-observed ones when a row is attached (§4.9 step 1).
pub fn fuse_sessions(sessions: Vec<Session>, agent_sessions: &[AgentSession]) -> Vec<FusedSession> {
    let mut by_window: HashMap<&str, &AgentSession> = HashMap::new();
    for row in agent_sessions {
        if let Some(window) = row.current_window.as_deref() {
            by_window.insert(window, row);
        }
    }

    sessions
        .into_iter()
        .map(|mut session| match by_window.get(session.tmux_target.as_str()) {
            Some(row) => {
                session.last_activity = row.last_activity_at.clone();
                session.created_at = row.created_at.clone();
                FusedSession {
                    agent_session_id: Some(row.session_id.clone()),
                    agent_session_name: row.display_name.clone(),
                    log_file_path: Some(row.log_file_path.clone()),
                    last_user_message: row.last_user_message.clone(),
                    is_pinned: row.is_pinned,
                    session,
                }
            }
            None => FusedSession {
                agent_session_id: None,
                agent_session_name: None,
                log_file_path: None,
                last_user_message: None,
                is_pinned: false,
                session,
            },
        })
        .collect()
}

/// For every active association whose window vanished from the scanner's
/// set, clear `currentWindow` and emit `session-orphaned` (§4.9 step 2).
pub fn orphan_missing_windows(
    conn: &Connection,
    bus: &EventBus,
    agent_sessions: &[AgentSession],
    live_targets: &HashSet<String>,
    now: &str,
) -> DaemonResult<usize> {
    let mut orphaned = 0;
    for row in agent_sessions {
        let Some(window) = row.current_window.clone() else {
            continue;
        };
        if live_targets.contains(&window) {
            continue;
        }
        let mut updated = row.clone();
        updated.current_window = None;
        db::upsert_agent_session(conn, &updated)?;
        let _ = bus.publish_event(DaemonEvent {
            event_type: DaemonEventType::SessionOrphaned,
            session_id: Some(row.session_id.clone()),
            detected_at: now.to_string(),
            payload: Some(json!({ "agentSession": updated, "previousWindow": window, "reason": "window_missing" })),
        });
        orphaned += 1;
    }
    Ok(orphaned)
}

/// Startup-only re-check (§4.9 step 3): re-verify each live association
/// against its log file. A window whose display name still matches the
/// stored one survives an inconclusive or mismatched verification; only a
/// failed verification with a diverged name gets orphaned.
pub async fn verify_associations_at_startup(
    conn: &Connection,
    bus: &EventBus,
    agent_sessions: &[AgentSession],
    live_sessions: &[Session],
    logs_by_session: &HashMap<String, DiscoveredLog>,
    now: &str,
) -> DaemonResult<usize> {
    let sessions_by_target: HashMap<&str, &Session> =
        live_sessions.iter().map(|s| (s.tmux_target.as_str(), s)).collect();

    let mut orphaned = 0;
    for row in agent_sessions {
        let Some(window) = row.current_window.clone() else {
            continue;
        };
        let Some(session) = sessions_by_target.get(window.as_str()) else {
            continue; // already orphaned by orphan_missing_windows
        };
        let Some(log) = logs_by_session.get(&row.session_id) else {
            continue;
        };

        let outcome = verify_window_log_association(
            row.last_user_message.as_deref().unwrap_or(""),
            log,
        )
        .await;

        if matches!(outcome, VerifyOutcome::Verified) {
            continue;
        }

        let name_matches = row.display_name.as_deref() == Some(session.name.as_str());
        if name_matches {
            tracing::info!(
                session_id = %row.session_id,
                window = %window,
                ?outcome,
                "verification inconclusive but display name matches, keeping association"
            );
            continue;
        }

        let mut updated = row.clone();
        updated.current_window = None;
        db::upsert_agent_session(conn, &updated)?;
        let _ = bus.publish_event(DaemonEvent {
            event_type: DaemonEventType::SessionOrphaned,
            session_id: Some(row.session_id.clone()),
            detected_at: now.to_string(),
            payload: Some(json!({ "agentSession": updated, "previousWindow": window, "reason": "verification_failed" })),
        });
        orphaned += 1;
    }
    Ok(orphaned)
}

/// Live `sessionId -> expiryMs` map driving force-working overrides
/// (§4.12). A user pressing Enter in a terminal extends the window's grace
/// period; hydration rewrites any still-live session to `working`
/// regardless of what the scanner observed.
pub struct ForceWorkingOverrides {
    expiry_ms: Mutex<HashMap<String, i64>>,
}

impl ForceWorkingOverrides {
    pub fn new() -> Self {
        Self {
            expiry_ms: Mutex::new(HashMap::new()),
        }
    }

    /// Record a user Enter for `session_id`, extending its override to
    /// `now_ms + grace_ms`.
    pub fn trigger(&self, session_id: &str, now_ms: i64, grace_ms: i64) {
        self.expiry_ms
            .lock()
            .expect("force-working map poisoned")
            .insert(session_id.to_string(), now_ms + grace_ms);
    }

    /// Whether `session_id` currently holds a live override. Evicts the
    /// entry first if it has expired.
    pub fn is_live(&self, session_id: &str, now_ms: i64) -> bool {
        let mut map = self.expiry_ms.lock().expect("force-working map poisoned");
        match map.get(session_id) {
            Some(expiry) if *expiry > now_ms => true,
            Some(_) => {
                map.remove(session_id);
                false
            }
            None => false,
        }
    }

    /// Apply every live override to the fused set, evicting expired
    /// entries along the way.
    pub fn apply(&self, sessions: &mut [FusedSession], now_ms: i64) {
        let mut map = self.expiry_ms.lock().expect("force-working map poisoned");
        map.retain(|_, expiry| *expiry > now_ms);
        for fused in sessions.iter_mut() {
            if map.contains_key(&fused.session.id) && fused.session.status != SessionStatus::Working {
                fused.session.status = SessionStatus::Working;
            }
        }
    }
}

impl Default for ForceWorkingOverrides {
    fn default() -> Self {
        Self::new()
    }
}

/// Resume command templates (§4.10), one per agent type, substituting
/// `{sessionId}` into the configured template.
#[derive(Clone, Debug)]
pub struct ResumeTemplates {
    pub claude: String,
    pub codex: String,
}

impl Default for ResumeTemplates {
    fn default() -> Self {
        Self {
            claude: "claude --resume {sessionId}".to_string(),
            codex: "codex resume {sessionId}".to_string(),
        }
    }
}

impl ResumeTemplates {
    pub fn command_for(&self, agent_type: AgentType, session_id: &str) -> String {
        let template = match agent_type {
            AgentType::Codex => &self.codex,
            _ => &self.claude,
        };
        template.replace("{sessionId}", session_id)
    }
}

/// Abstraction over "create a new tmux window running this command",
/// mirroring the `TerminalProxy` split so resurrection logic is testable
/// without shelling out to a real tmux server.
#[async_trait]
pub trait WindowSpawner: Send + Sync {
    async fn spawn_window(&self, project_path: &str, command: &str) -> DaemonResult<String>;
}

/// Enumerate orphaned pinned rows and attempt to resurrect each into a
/// fresh tmux window (§4.10). Successes update `currentWindow`; failures
/// auto-unpin, persist the error, and broadcast `session-resurrection-failed`.
pub async fn resurrect_pinned_sessions(
    conn: &Connection,
    bus: &EventBus,
    spawner: &dyn WindowSpawner,
    templates: &ResumeTemplates,
    now: &str,
) -> DaemonResult<usize> {
    let orphans = db::list_pinned_orphans(conn)?;
    let mut resumed = 0;

    for row in orphans {
        let command = templates.command_for(row.agent_type, &row.session_id);
        let project_path = row.project_path.clone().unwrap_or_else(|| ".".to_string());

        match spawner.spawn_window(&project_path, &command).await {
            Ok(window) => {
                let mut updated = row.clone();
                updated.current_window = Some(window);
                updated.last_resume_error = None;
                db::upsert_agent_session(conn, &updated)?;
                resumed += 1;
            }
            Err(err) => {
                let mut updated = row.clone();
                updated.is_pinned = false;
                updated.last_resume_error = Some(err.to_string());
                db::upsert_agent_session(conn, &updated)?;
                let _ = bus.publish_event(DaemonEvent {
                    event_type: DaemonEventType::SessionResurrectionFailed,
                    session_id: Some(row.session_id.clone()),
                    detected_at: now.to_string(),
                    payload: Some(json!({ "agentSession": updated, "error": err.to_string() })),
                });
            }
        }
    }

    Ok(resumed)
}

/// Real `WindowSpawner`: opens a fresh window in the daemon's managed tmux
/// session and starts the resume command in it.
pub struct TmuxWindowSpawner {
    pub tmux_session: String,
}

#[async_trait]
impl WindowSpawner for TmuxWindowSpawner {
    async fn spawn_window(&self, project_path: &str, command: &str) -> DaemonResult<String> {
        use std::time::Duration;
        use tokio::process::Command;
        use tokio::time::timeout;

        let fut = Command::new("tmux")
            .args([
                "new-window",
                "-t",
                &self.tmux_session,
                "-c",
                project_path,
                "-P",
                "-F",
                "#{window_id}",
                command,
            ])
            .output();
        let output = timeout(Duration::from_secs(5), fut)
            .await
            .map_err(|_| crate::error::DaemonError::Tmux("timed out spawning window".to_string()))?
            .map_err(|e| crate::error::DaemonError::Tmux(e.to_string()))?;

        if !output.status.success() {
            return Err(crate::error::DaemonError::Tmux(format!(
                "tmux new-window exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let window_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(format!("{}:{}", self.tmux_session, window_id))
    }
}
