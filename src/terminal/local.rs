//! Local terminal proxy: attaches a PTY to a dedicated tmux session created
//! for this WebSocket connection, then `switch-client`s it between windows
//! as the user navigates the board without tearing down the PTY.

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{TerminalErrorKind, TerminalProxy};
use crate::error::{DaemonError, DaemonResult};

const CLIENT_TTY_DISCOVERY_RETRIES: u32 = 10;
const CLIENT_TTY_DISCOVERY_DELAY_MS: u64 = 50;

pub struct LocalTerminal {
    connection_id: String,
    proxy_session: String,
    master: Option<Box<dyn MasterPty + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    writer: Option<Arc<Mutex<Box<dyn std::io::Write + Send>>>>,
    /// tty of the tmux client driving our PTY's `tmux attach`, discovered
    /// via `list-clients` once the attach completes. `switch-client -c`
    /// needs this, not the proxy session name.
    client_tty: Option<String>,
    ready: bool,
}

impl LocalTerminal {
    pub fn new(base_session: &str, connection_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            proxy_session: format!("{base_session}-ws-{connection_id}"),
            master: None,
            child: None,
            writer: None,
            client_tty: None,
            ready: false,
        }
    }

    fn to_attach_err(err: impl std::fmt::Display) -> DaemonError {
        DaemonError::Tmux(format!(
            "{}: {}",
            TerminalErrorKind::TmuxAttachFailed.code(),
            err
        ))
    }

    async fn ensure_proxy_session(proxy_session: &str, tmux_target: &str) -> DaemonResult<()> {
        let status = Command::new("tmux")
            .args(["new-session", "-d", "-s", proxy_session, "-t", tmux_target])
            .status()
            .await
            .map_err(Self::to_attach_err)?;
        if !status.success() {
            // Session may already exist from a prior switch; that's fine.
        }
        Ok(())
    }
}

/// Match a spawned `tmux attach` child's pid against `list-clients` output to
/// find the pty tmux registered for it. The client doesn't always show up in
/// the instant after spawn, so this retries briefly.
async fn discover_client_tty(pid: u32) -> Option<String> {
    for _ in 0..CLIENT_TTY_DISCOVERY_RETRIES {
        let output = Command::new("tmux")
            .args(["list-clients", "-F", "#{client_tty} #{client_pid}"])
            .output()
            .await
            .ok()?;
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            for line in text.lines() {
                let mut parts = line.split_whitespace();
                let (Some(tty), Some(client_pid)) = (parts.next(), parts.next()) else {
                    continue;
                };
                if client_pid.parse::<u32>() == Ok(pid) {
                    return Some(tty.to_string());
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(CLIENT_TTY_DISCOVERY_DELAY_MS)).await;
    }
    None
}

#[async_trait]
impl TerminalProxy for LocalTerminal {
    async fn start(&mut self, tmux_target: &str, output_tx: mpsc::Sender<Vec<u8>>) -> DaemonResult<()> {
        Self::ensure_proxy_session(&self.proxy_session, tmux_target).await?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(Self::to_attach_err)?;

        let mut cmd = CommandBuilder::new("tmux");
        cmd.args(["attach", "-t", &self.proxy_session]);

        let child = pair.slave.spawn_command(cmd).map_err(Self::to_attach_err)?;
        let writer = pair.master.take_writer().map_err(Self::to_attach_err)?;
        let mut reader = pair.master.try_clone_reader().map_err(Self::to_attach_err)?;

        self.client_tty = match child.process_id() {
            Some(pid) => discover_client_tty(pid).await,
            None => None,
        };
        if self.client_tty.is_none() {
            tracing::warn!(
                connection_id = %self.connection_id,
                "could not discover tmux client tty after attach; switch-client will target the proxy session"
            );
        }

        // portable-pty's reader is a blocking `std::io::Read`; ferry bytes to
        // the async side on a dedicated OS thread rather than polling it
        // from a tokio task.
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        self.master = Some(pair.master);
        self.child = Some(child);
        self.writer = Some(Arc::new(Mutex::new(writer)));
        self.ready = true;
        Ok(())
    }

    async fn switch_to(&mut self, tmux_target: &str) -> DaemonResult<()> {
        let client = self.client_tty.as_deref().unwrap_or(&self.proxy_session);
        let status = Command::new("tmux")
            .args(["switch-client", "-t", tmux_target, "-c", client])
            .status()
            .await
            .map_err(|e| {
                DaemonError::Tmux(format!("{}: {}", TerminalErrorKind::TmuxSwitchFailed.code(), e))
            })?;
        if !status.success() {
            return Err(DaemonError::Tmux(format!(
                "{}: switch-client exited {}",
                TerminalErrorKind::TmuxSwitchFailed.code(),
                status
            )));
        }
        let _ = Command::new("tmux").args(["refresh-client", "-t", client]).status().await;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> DaemonResult<()> {
        let Some(writer) = &self.writer else {
            return Err(DaemonError::Tmux(format!(
                "{}: terminal not started",
                TerminalErrorKind::InvalidWindow.code()
            )));
        };
        let mut guard = writer.lock().unwrap();
        guard.write_all(data).map_err(DaemonError::from)
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> DaemonResult<()> {
        let Some(master) = &self.master else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(Self::to_attach_err)
    }

    async fn dispose(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
        }
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", &self.proxy_session])
            .status()
            .await;
        self.client_tty = None;
        self.ready = false;
        tracing::debug!(connection_id = %self.connection_id, "local terminal disposed");
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}
