pub mod remote;
pub mod tmux;

pub use remote::{RemoteConfig, RemotePoller};
pub use tmux::{TmuxScanner, TmuxScannerConfig};
