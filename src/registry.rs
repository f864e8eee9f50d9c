//! Session registry (§4.1): the single source of truth for "what sessions
//! exist right now", fed by the local scanner and the remote poller and
//! read by every transport. Diffing lives here, not in the scanners, so
//! both producers get identical change-detection and event semantics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::bus::{DaemonEvent, DaemonEventType, EventBus, SessionsChange, SessionsChangeKind};
use crate::models::{AgentSession, Session};
use serde_json::json;

pub struct Registry {
    sessions: DashMap<String, Session>,
    bus: Arc<EventBus>,
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Later of two ISO timestamps, falling back to `b` if either fails to
/// parse (never silently drops a newer timestamp due to a parse error on
/// the other side).
fn later(a: &str, b: &str) -> String {
    match (parse_ts(a), parse_ts(b)) {
        (Some(ta), Some(tb)) => if ta >= tb { a.to_string() } else { b.to_string() },
        _ => b.to_string(),
    }
}

fn semantically_equal(a: &Session, b: &Session) -> bool {
    a.name == b.name
        && a.tmux_target == b.tmux_target
        && a.project_path == b.project_path
        && a.status == b.status
        && a.last_activity == b.last_activity
        && a.source == b.source
        && a.host == b.host
        && a.remote == b.remote
        && a.start_command == b.start_command
        && a.agent_type == b.agent_type
}

impl Registry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            sessions: DashMap::new(),
            bus,
        }
    }

    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Replace the set of sessions known from one source (e.g. the local
    /// scanner's full tick, or one remote host's poll). Preserves
    /// `createdAt` and the monotonic maximum of `lastActivity` for ids that
    /// already existed; only emits a `sessions` broadcast when something
    /// actually changed, and one `session-removed` event per dropped id.
    pub fn replace_sessions(&self, incoming: Vec<Session>, now: &str) -> bool {
        let incoming_ids: std::collections::HashSet<String> =
            incoming.iter().map(|s| s.id.clone()).collect();

        let removed: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !incoming_ids.contains(id))
            .collect();

        let mut any_change = !removed.is_empty();
        let mut merged = Vec::with_capacity(incoming.len());

        for mut session in incoming {
            if let Some(existing) = self.sessions.get(&session.id) {
                session.created_at = existing.created_at.clone();
                session.last_activity = later(&existing.last_activity, &session.last_activity);
                if !semantically_equal(&existing, &session) {
                    any_change = true;
                }
            } else {
                any_change = true;
            }
            merged.push(session);
        }

        self.sessions.retain(|id, _| incoming_ids.contains(id));
        for session in &merged {
            self.sessions.insert(session.id.clone(), session.clone());
        }

        for id in &removed {
            let _ = self.bus.publish_event(DaemonEvent {
                event_type: DaemonEventType::Custom("session-removed".to_string()),
                session_id: Some(id.clone()),
                detected_at: now.to_string(),
                payload: None,
            });
        }

        if any_change {
            let _ = self.bus.publish_state(SessionsChange {
                kind: SessionsChangeKind::Full,
                sessions: merged,
                removed_ids: removed,
                observed_at: now.to_string(),
            });
        }

        any_change
    }

    /// Patch a single session (e.g. a force-working override, or a
    /// just-created window). Always broadcasts, regardless of whether the
    /// content actually changed — callers that need change-suppression use
    /// `replace_sessions`.
    pub fn update_session(&self, session: Session, now: &str) {
        let mut session = session;
        if let Some(existing) = self.sessions.get(&session.id) {
            session.created_at = existing.created_at.clone();
            session.last_activity = later(&existing.last_activity, &session.last_activity);
        }
        self.sessions.insert(session.id.clone(), session.clone());
        let _ = self.bus.publish_state(SessionsChange {
            kind: SessionsChangeKind::Update,
            sessions: vec![session],
            removed_ids: vec![],
            observed_at: now.to_string(),
        });
    }

    /// Publish the `agent_sessions` table's active/inactive partition
    /// (§4.1): rows currently attached to a live window vs. every other
    /// discovered log, so the UI can list resumable sessions without a tmux
    /// window of its own.
    pub fn set_agent_sessions(&self, active: &[AgentSession], inactive: &[AgentSession], now: &str) {
        let _ = self.bus.publish_event(DaemonEvent {
            event_type: DaemonEventType::AgentSessions,
            session_id: None,
            detected_at: now.to_string(),
            payload: Some(json!({ "active": active, "inactive": inactive })),
        });
    }

    pub fn remove(&self, id: &str, now: &str) {
        if self.sessions.remove(id).is_some() {
            let _ = self.bus.publish_event(DaemonEvent {
                event_type: DaemonEventType::Custom("session-removed".to_string()),
                session_id: Some(id.to_string()),
                detected_at: now.to_string(),
                payload: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, SessionSource, SessionStatus};

    fn session(id: &str, status: SessionStatus, last_activity: &str) -> Session {
        Session {
            id: id.to_string(),
            name: "main".to_string(),
            tmux_target: format!("{id}.0"),
            project_path: None,
            status,
            last_activity: last_activity.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            source: SessionSource::Managed,
            host: None,
            remote: false,
            start_command: None,
            agent_type: AgentType::Claude,
        }
    }

    #[test]
    fn replace_sessions_preserves_created_at_and_monotonic_activity() {
        let bus = Arc::new(EventBus::new(8));
        let registry = Registry::new(bus);
        registry.replace_sessions(
            vec![session("a", SessionStatus::Working, "2026-01-01T00:00:10Z")],
            "2026-01-01T00:00:10Z",
        );

        let mut updated = session("a", SessionStatus::Waiting, "2026-01-01T00:00:05Z");
        updated.created_at = "2099-01-01T00:00:00Z".to_string(); // should be overwritten
        registry.replace_sessions(vec![updated], "2026-01-01T00:00:11Z");

        let stored = registry.get("a").unwrap();
        assert_eq!(stored.created_at, "2026-01-01T00:00:00Z");
        // last_activity must not regress even though the incoming value is older
        assert_eq!(stored.last_activity, "2026-01-01T00:00:10Z");
    }

    #[test]
    fn replace_sessions_emits_removed_for_dropped_ids() {
        let bus = Arc::new(EventBus::new(8));
        let registry = Registry::new(bus);
        registry.replace_sessions(
            vec![session("a", SessionStatus::Working, "t")],
            "t",
        );
        let mut events = registry.bus.subscribe_events();
        let changed = registry.replace_sessions(vec![], "t2");
        assert!(changed);
        let event = events.try_recv().unwrap();
        assert_eq!(event.session_id.as_deref(), Some("a"));
    }

    #[test]
    fn replace_sessions_no_change_does_not_broadcast() {
        let bus = Arc::new(EventBus::new(8));
        let registry = Registry::new(bus);
        let s = session("a", SessionStatus::Working, "t");
        registry.replace_sessions(vec![s.clone()], "t");
        let mut rx = registry.bus.subscribe_state();
        let changed = registry.replace_sessions(vec![s], "t");
        assert!(!changed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_agent_sessions_publishes_active_and_inactive_partition() {
        let bus = Arc::new(EventBus::new(8));
        let registry = Registry::new(bus);
        let mut events = registry.bus.subscribe_events();

        let active = AgentSession::new("s1", AgentType::Claude, "/tmp/s1.jsonl", "t");
        let inactive = AgentSession::new("s2", AgentType::Codex, "/tmp/s2.jsonl", "t");
        registry.set_agent_sessions(&[active], &[inactive], "t");

        let event = events.try_recv().unwrap();
        assert!(matches!(event.event_type, DaemonEventType::AgentSessions));
        let payload = event.payload.unwrap();
        assert_eq!(payload["active"][0]["sessionId"], "s1");
        assert_eq!(payload["inactive"][0]["sessionId"], "s2");
    }

    #[test]
    fn update_session_always_broadcasts() {
        let bus = Arc::new(EventBus::new(8));
        let registry = Registry::new(bus);
        let mut rx = registry.bus.subscribe_state();
        registry.update_session(session("a", SessionStatus::Working, "t"), "t");
        assert!(rx.try_recv().is_ok());
        registry.update_session(registry.get("a").unwrap(), "t");
        assert!(rx.try_recv().is_ok(), "second identical update still broadcasts");
    }
}
