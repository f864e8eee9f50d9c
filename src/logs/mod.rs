pub mod discovery;
pub mod matcher;
pub mod poller;

pub use discovery::DiscoveredLog;
pub use matcher::{match_windows_to_logs_by_exact_rg, verify_window_log_association, VerifyOutcome, WindowCandidate};
pub use poller::{LogPoller, LogPollerConfig};
