use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostReachability {
    Online,
    Stale,
    Unreachable,
}

/// Last-known reachability of a remote host polled by the SSH scanner
/// (§4.11), broadcast to clients as `host-status` frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub host: String,
    pub reachability: HostReachability,
    pub last_success_at: Option<String>,
    pub last_error: Option<String>,
}

impl HostStatus {
    pub fn online(host: impl Into<String>, now: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            reachability: HostReachability::Online,
            last_success_at: Some(now.into()),
            last_error: None,
        }
    }
}
