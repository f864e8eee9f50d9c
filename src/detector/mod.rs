pub mod agent_type;
pub mod pane_message;
pub mod status;
pub mod user_message;

pub use agent_type::infer_agent_type;
pub use pane_message::extract_recent_user_messages;
pub use status::{infer_session_status, StatusConfig, StatusInput, StatusResult};
pub use user_message::{extract_user_message, trace_line_fallback};
