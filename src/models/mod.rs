pub mod agent_session;
pub mod host_status;
pub mod pane_cache;
pub mod session;

pub use agent_session::AgentSession;
pub use host_status::{HostReachability, HostStatus};
pub use pane_cache::PaneCacheState;
pub use session::{AgentType, Session, SessionSource, SessionStatus};
