//! Terminal proxy (§4.13): the shared contract a WebSocket connection uses
//! to drive a tmux attach session, whether it's a local PTY or a remote ssh
//! pipe. One trait, two implementations, dispatched dynamically so the WS
//! handler never has to know which kind it's holding.

pub mod local;
pub mod ssh;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DaemonResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalErrorKind {
    InvalidWindow,
    TmuxAttachFailed,
    TmuxSwitchFailed,
}

impl TerminalErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            TerminalErrorKind::InvalidWindow => "ERR_INVALID_WINDOW",
            TerminalErrorKind::TmuxAttachFailed => "ERR_TMUX_ATTACH_FAILED",
            TerminalErrorKind::TmuxSwitchFailed => "ERR_TMUX_SWITCH_FAILED",
        }
    }

    /// Whether the WS dispatcher should offer the client a retry.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TerminalErrorKind::TmuxAttachFailed | TerminalErrorKind::TmuxSwitchFailed
        )
    }
}

/// `start` takes the sender half of the WS connection's output channel so
/// each implementation can spawn whatever reader it needs (a PTY reader
/// thread locally, a tokio task over ssh's stdout remotely) without the
/// dispatcher knowing which.
#[async_trait]
pub trait TerminalProxy: Send {
    async fn start(&mut self, tmux_target: &str, output_tx: mpsc::Sender<Vec<u8>>) -> DaemonResult<()>;
    async fn switch_to(&mut self, tmux_target: &str) -> DaemonResult<()>;
    async fn write(&mut self, data: &[u8]) -> DaemonResult<()>;
    async fn resize(&mut self, cols: u16, rows: u16) -> DaemonResult<()>;
    async fn dispose(&mut self);
    fn is_ready(&self) -> bool;
}
