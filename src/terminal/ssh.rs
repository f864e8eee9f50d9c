//! Remote terminal proxy: pipes a WebSocket connection through `ssh -tt`
//! into the remote host's tmux attach session instead of a local PTY.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use super::{TerminalErrorKind, TerminalProxy};
use crate::error::{DaemonError, DaemonResult};

pub struct SshTerminal {
    host: String,
    ssh_opts: Vec<String>,
    connection_id: String,
    child: Option<Child>,
    current_target: Option<String>,
    output_tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl SshTerminal {
    pub fn new(host: &str, ssh_opts: &[String], connection_id: &str) -> Self {
        Self {
            host: host.to_string(),
            ssh_opts: ssh_opts.to_vec(),
            connection_id: connection_id.to_string(),
            child: None,
            current_target: None,
            output_tx: None,
        }
    }

    fn attach_err(err: impl std::fmt::Display) -> DaemonError {
        DaemonError::Ssh(format!(
            "{}: {}",
            TerminalErrorKind::TmuxAttachFailed.code(),
            err
        ))
    }

    async fn spawn_attach(&mut self, tmux_target: &str) -> DaemonResult<()> {
        if let Some(mut old) = self.child.take() {
            let _ = old.kill().await;
        }

        let mut cmd = Command::new("ssh");
        cmd.arg("-tt").args(&self.ssh_opts).arg(&self.host).arg(format!(
            "tmux attach -t {tmux_target}"
        ));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(Self::attach_err)?;

        if let (Some(tx), Some(mut stdout)) = (self.output_tx.clone(), child.stdout.take()) {
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }

        self.child = Some(child);
        self.current_target = Some(tmux_target.to_string());
        Ok(())
    }
}

#[async_trait]
impl TerminalProxy for SshTerminal {
    async fn start(&mut self, tmux_target: &str, output_tx: mpsc::Sender<Vec<u8>>) -> DaemonResult<()> {
        self.output_tx = Some(output_tx);
        self.spawn_attach(tmux_target).await
    }

    async fn switch_to(&mut self, tmux_target: &str) -> DaemonResult<()> {
        // Remote attach has no in-place switch-client equivalent over an ssh
        // pipe we own directly; re-attach to the new target instead.
        self.spawn_attach(tmux_target).await.map_err(|e| {
            DaemonError::Ssh(format!("{}: {e}", TerminalErrorKind::TmuxSwitchFailed.code()))
        })
    }

    async fn write(&mut self, data: &[u8]) -> DaemonResult<()> {
        let Some(child) = &mut self.child else {
            return Err(DaemonError::Ssh(format!(
                "{}: terminal not started",
                TerminalErrorKind::InvalidWindow.code()
            )));
        };
        let Some(stdin) = child.stdin.as_mut() else {
            return Err(DaemonError::Ssh("ssh child has no stdin".into()));
        };
        stdin.write_all(data).await.map_err(DaemonError::from)
    }

    async fn resize(&mut self, _cols: u16, _rows: u16) -> DaemonResult<()> {
        // No direct resize hook over a plain ssh -tt pipe; the remote pty
        // inherits whatever size ssh negotiated at connect time.
        Ok(())
    }

    async fn dispose(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.current_target = None;
        tracing::debug!(connection_id = %self.connection_id, host = %self.host, "ssh terminal disposed");
    }

    fn is_ready(&self) -> bool {
        self.child.is_some()
    }
}
