use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Working,
    Waiting,
    Permission,
    Unknown,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Working => "working",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Permission => "permission",
            SessionStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Managed,
    External,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Claude,
    Codex,
    Pi,
    Unknown,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Pi => "pi",
            AgentType::Unknown => "unknown",
        }
    }
}

/// A live tmux window/pane observed by a scanner. One `Session` per window,
/// `id` is `"<tmuxSession>:<windowId>"` for local windows or
/// `"remote:<host>:<tmuxSession>:<windowId>"` for windows discovered by the
/// remote poller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub tmux_target: String,
    pub project_path: Option<String>,
    pub status: SessionStatus,
    pub last_activity: String,
    pub created_at: String,
    pub source: SessionSource,
    pub host: Option<String>,
    pub remote: bool,
    pub start_command: Option<String>,
    pub agent_type: AgentType,
}

impl Session {
    pub fn local_id(tmux_session: &str, window_id: &str) -> String {
        format!("{tmux_session}:{window_id}")
    }

    pub fn remote_id(host: &str, tmux_session: &str, window_id: &str) -> String {
        format!("remote:{host}:{tmux_session}:{window_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_id_format() {
        assert_eq!(Session::local_id("main", "@3"), "main:@3");
    }

    #[test]
    fn remote_id_format() {
        assert_eq!(
            Session::remote_id("box1", "main", "@3"),
            "remote:box1:main:@3"
        );
    }

    #[test]
    fn status_round_trips_as_lowercase() {
        assert_eq!(SessionStatus::Permission.as_str(), "permission");
        assert_eq!(AgentType::Pi.as_str(), "pi");
    }
}
