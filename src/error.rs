//! Crate-wide error type. Every subsystem funnels its failures through
//! `DaemonError` so transports can map them to a stable `code()` without
//! knowing which subsystem raised them.

use std::fmt;

#[derive(Debug)]
pub enum DaemonError {
    Config(String),
    Db(String),
    Tmux(String),
    Ssh(String),
    Matcher(String),
    Transport(String),
    NotFound(String),
    Forbidden(String),
    Validation(String),
    Io(std::io::Error),
}

impl DaemonError {
    /// Stable short code used to populate JSON-RPC error codes and WS
    /// `error`/`terminal-error` frame codes.
    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::Config(_) => "CONFIG_ERROR",
            DaemonError::Db(_) => "DB_ERROR",
            DaemonError::Tmux(_) => "TMUX_ERROR",
            DaemonError::Ssh(_) => "SSH_ERROR",
            DaemonError::Matcher(_) => "MATCHER_ERROR",
            DaemonError::Transport(_) => "TRANSPORT_ERROR",
            DaemonError::NotFound(_) => "NOT_FOUND",
            DaemonError::Forbidden(_) => "FORBIDDEN",
            DaemonError::Validation(_) => "VALIDATION_ERROR",
            DaemonError::Io(_) => "IO_ERROR",
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Config(msg) => write!(f, "config error: {msg}"),
            DaemonError::Db(msg) => write!(f, "database error: {msg}"),
            DaemonError::Tmux(msg) => write!(f, "tmux error: {msg}"),
            DaemonError::Ssh(msg) => write!(f, "ssh error: {msg}"),
            DaemonError::Matcher(msg) => write!(f, "log matcher error: {msg}"),
            DaemonError::Transport(msg) => write!(f, "transport error: {msg}"),
            DaemonError::NotFound(msg) => write!(f, "not found: {msg}"),
            DaemonError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            DaemonError::Validation(msg) => write!(f, "invalid request: {msg}"),
            DaemonError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::Io(err)
    }
}

impl From<rusqlite::Error> for DaemonError {
    fn from(err: rusqlite::Error) -> Self {
        DaemonError::Db(err.to_string())
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;
