//! In-process event bus. Three independent broadcast channels keep the
//! registry, the reconciler, and WS dispatch decoupled from each other so
//! none of them needs a reference back to its publishers — only to the bus.

use crate::metrics::{Timer, METRICS};
use crate::models::{HostStatus, Session};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Whether a `SessionsChange` is a whole-table resync (`replace_sessions`,
/// broadcast to clients as `sessions`) or a single-row patch
/// (`update_session`, broadcast as `session-update`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionsChangeKind {
    Full,
    Update,
}

/// A full or partial snapshot of the session table, as produced by
/// `registry::replace_sessions` / `registry::update_session` (§4.1).
#[derive(Clone, Debug)]
pub struct SessionsChange {
    pub kind: SessionsChangeKind,
    pub sessions: Vec<Session>,
    pub removed_ids: Vec<String>,
    pub observed_at: String,
}

#[derive(Clone, Debug)]
pub enum DaemonEventType {
    SessionOrphaned,
    SessionActivated,
    SessionResurrectionFailed,
    HostStatus,
    /// The registry's active/inactive `AgentSession` partition changed.
    AgentSessions,
    Custom(String),
}

#[derive(Clone, Debug)]
pub struct DaemonEvent {
    pub event_type: DaemonEventType,
    pub session_id: Option<String>,
    pub detected_at: String,
    pub payload: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct ClientUpdate {
    pub kind: String,
    pub payload: Option<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct BusMetricsSnapshot {
    pub state_sent: u64,
    pub state_errors: u64,
    pub events_sent: u64,
    pub events_errors: u64,
    pub client_sent: u64,
    pub client_errors: u64,
}

pub struct EventBus {
    state_tx: broadcast::Sender<SessionsChange>,
    event_tx: broadcast::Sender<DaemonEvent>,
    client_tx: broadcast::Sender<ClientUpdate>,
    state_sent: AtomicU64,
    state_errors: AtomicU64,
    events_sent: AtomicU64,
    events_errors: AtomicU64,
    client_sent: AtomicU64,
    client_errors: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (state_tx, _) = broadcast::channel(capacity);
        let (event_tx, _) = broadcast::channel(capacity);
        let (client_tx, _) = broadcast::channel(capacity);
        Self {
            state_tx,
            event_tx,
            client_tx,
            state_sent: AtomicU64::new(0),
            state_errors: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_errors: AtomicU64::new(0),
            client_sent: AtomicU64::new(0),
            client_errors: AtomicU64::new(0),
        }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionsChange> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_clients(&self) -> broadcast::Receiver<ClientUpdate> {
        self.client_tx.subscribe()
    }

    pub fn publish_state(
        &self,
        change: SessionsChange,
    ) -> Result<usize, broadcast::error::SendError<SessionsChange>> {
        let _timer = Timer::new(&METRICS.event_processing);
        match self.state_tx.send(change) {
            Ok(count) => {
                self.state_sent.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.state_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    pub fn publish_event(
        &self,
        event: DaemonEvent,
    ) -> Result<usize, broadcast::error::SendError<DaemonEvent>> {
        let _timer = Timer::new(&METRICS.event_processing);
        match self.event_tx.send(event) {
            Ok(count) => {
                self.events_sent.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.events_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    pub fn publish_client_update(
        &self,
        update: ClientUpdate,
    ) -> Result<usize, broadcast::error::SendError<ClientUpdate>> {
        let _timer = Timer::new(&METRICS.event_processing);
        match self.client_tx.send(update) {
            Ok(count) => {
                self.client_sent.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.client_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    pub fn publish_host_status(&self, status: HostStatus) {
        let _ = self.publish_event(DaemonEvent {
            event_type: DaemonEventType::HostStatus,
            session_id: None,
            detected_at: status.last_success_at.clone().unwrap_or_default(),
            payload: serde_json::to_value(&status).ok(),
        });
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            state_sent: self.state_sent.load(Ordering::Relaxed),
            state_errors: self.state_errors.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_errors: self.events_errors.load(Ordering::Relaxed),
            client_sent: self.client_sent.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, SessionSource, SessionStatus};

    fn sample_session() -> Session {
        Session {
            id: "main:@1".to_string(),
            name: "main".to_string(),
            tmux_target: "main:1.0".to_string(),
            project_path: None,
            status: SessionStatus::Waiting,
            last_activity: "2026-01-01T00:00:00Z".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            source: SessionSource::Managed,
            host: None,
            remote: false,
            start_command: None,
            agent_type: AgentType::Claude,
        }
    }

    #[tokio::test]
    async fn state_channel_sends_and_receives() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe_state();
        let change = SessionsChange {
            kind: SessionsChangeKind::Full,
            sessions: vec![sample_session()],
            removed_ids: vec![],
            observed_at: "2026-01-01T00:00:00Z".to_string(),
        };
        bus.publish_state(change).expect("publish");
        let received = rx.recv().await.expect("receive");
        assert_eq!(received.sessions.len(), 1);
        let metrics = bus.metrics();
        assert_eq!(metrics.state_sent, 1);
    }

    #[tokio::test]
    async fn event_channel_carries_host_status() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe_events();
        bus.publish_host_status(HostStatus::online("box1", "2026-01-01T00:00:00Z"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.event_type, DaemonEventType::HostStatus));
    }
}
