use serde::{Deserialize, Serialize};

use super::session::AgentType;

/// Persistent record of a logged agent conversation discovered by the log
/// scanner, keyed by `sessionId` (the agent CLI's own identifier, parsed out
/// of its JSONL log path/contents). Lives independently of whether a tmux
/// window is currently attached to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub session_id: String,
    pub agent_type: AgentType,
    pub project_path: Option<String>,
    pub log_file_path: String,
    pub display_name: Option<String>,
    pub current_window: Option<String>,
    pub last_activity_at: String,
    pub created_at: String,
    pub last_user_message: Option<String>,
    pub is_pinned: bool,
    pub last_resume_error: Option<String>,
}

impl AgentSession {
    pub fn new(session_id: impl Into<String>, agent_type: AgentType, log_file_path: impl Into<String>, now: impl Into<String>) -> Self {
        let now = now.into();
        Self {
            session_id: session_id.into(),
            agent_type,
            project_path: None,
            log_file_path: log_file_path.into(),
            display_name: None,
            current_window: None,
            last_activity_at: now.clone(),
            created_at: now,
            last_user_message: None,
            is_pinned: false,
            last_resume_error: None,
        }
    }
}
