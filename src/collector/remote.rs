//! Remote SSH poller (§4.11): one background task per process, fanning a
//! tmux listing out to every configured host concurrently each tick.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::process::Command;
use tokio::time::timeout;

use crate::collector::tmux::parse_simple_windows;
use crate::error::{DaemonError, DaemonResult};
use crate::models::{HostReachability, HostStatus, Session};

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub hosts: Vec<String>,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub stale_ms: i64,
    pub ssh_opts: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            poll_interval_ms: 4_000,
            timeout_ms: 3_000,
            stale_ms: 15_000,
            ssh_opts: vec!["-o".to_string(), "BatchMode=yes".to_string()],
        }
    }
}

pub struct RemotePoller {
    config: RemoteConfig,
}

impl RemotePoller {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    /// Poll every configured host concurrently, returning each host's
    /// sessions (empty on failure) alongside its `HostStatus`.
    pub async fn poll_tick(&self, now_iso: &str) -> Vec<(HostStatus, Vec<Session>)> {
        let futures = self
            .config
            .hosts
            .iter()
            .map(|host| self.poll_host(host.clone(), now_iso.to_string()));
        join_all(futures).await
    }

    async fn poll_host(&self, host: String, now_iso: String) -> (HostStatus, Vec<Session>) {
        match self.fetch_windows(&host).await {
            Ok(sessions) => (HostStatus::online(host, now_iso), sessions),
            Err(err) => (
                HostStatus {
                    host,
                    reachability: HostReachability::Unreachable,
                    last_success_at: None,
                    last_error: Some(err.to_string()),
                },
                Vec::new(),
            ),
        }
    }

    async fn fetch_windows(&self, host: &str) -> DaemonResult<Vec<Session>> {
        let mut args: Vec<String> = self.config.ssh_opts.clone();
        args.push(host.to_string());
        args.push(
            "tmux list-windows -a -F '#{session_name}\t#{window_id}\t#{window_name}'".to_string(),
        );

        let _timer = crate::metrics::Timer::new(&crate::metrics::METRICS.ssh_cmd);
        let fut = Command::new("ssh").args(&args).output();
        let output = timeout(Duration::from_millis(self.config.timeout_ms), fut)
            .await
            .map_err(|_| DaemonError::Ssh(format!("ssh to {host} timed out")))?
            .map_err(|e| DaemonError::Ssh(e.to_string()))?;

        if !output.status.success() {
            return Err(DaemonError::Ssh(format!(
                "ssh {host} exited with {}",
                output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_simple_windows(&text)
            .into_iter()
            .map(|(session_name, window_id, _window_name)| Session {
                id: Session::remote_id(host, &session_name, &window_id),
                name: session_name.clone(),
                tmux_target: format!("{session_name}:{window_id}"),
                project_path: None,
                status: crate::models::SessionStatus::Unknown,
                last_activity: String::new(),
                created_at: String::new(),
                source: crate::models::SessionSource::External,
                host: Some(host.to_string()),
                remote: true,
                start_command: None,
                agent_type: crate::models::AgentType::Unknown,
            })
            .collect())
    }
}
