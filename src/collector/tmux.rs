//! Local tmux scanner (§4.2): enumerates every window on the local tmux
//! server, captures each pane's tail, and assembles `Session` rows ready for
//! `Registry::replace_sessions`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::timeout;

use crate::detector::pane_message::extract_recent_user_messages;
use crate::detector::{infer_agent_type, infer_session_status, StatusConfig, StatusInput};
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::{Timer, METRICS};
use crate::models::{PaneCacheState, Session, SessionSource};

/// Primary listing format: includes window activity (epoch seconds), used to
/// derive `createdAt`. Some older tmux builds reject unknown format keys
/// wholesale, so `list_windows` retries once with `LIST_WINDOWS_FORMAT_FALLBACK`.
const LIST_WINDOWS_FORMAT: &str = "#{session_name}\t#{window_id}\t#{window_name}\t#{pane_current_path}\t#{pane_start_command}\t#{pane_id}\t#{window_activity}";
const LIST_WINDOWS_FORMAT_FALLBACK: &str = "#{session_name}\t#{window_id}\t#{window_name}\t#{pane_current_path}\t#{pane_start_command}\t#{pane_id}";
const CAPTURE_LINE_CAP: usize = 30;
const RECENT_MESSAGE_LIMIT: usize = 3;
const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct TmuxScannerConfig {
    /// The daemon's own tmux session: windows inside it are "managed".
    pub tmux_session: String,
    /// Window-name prefixes that mark a window outside `tmux_session` as an
    /// "external" session worth tracking.
    pub discover_prefixes: Vec<String>,
    pub status: StatusConfig,
}

impl Default for TmuxScannerConfig {
    fn default() -> Self {
        Self {
            tmux_session: "agentboard".to_string(),
            discover_prefixes: vec!["claude-".to_string(), "codex-".to_string()],
            status: StatusConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct TmuxWindow {
    session_name: String,
    window_id: String,
    window_name: String,
    pane_current_path: String,
    pane_start_command: String,
    /// Window activity, epoch seconds, when the primary format was accepted.
    window_activity: Option<i64>,
}

pub struct TmuxScanner {
    config: TmuxScannerConfig,
    cache: HashMap<String, PaneCacheState>,
}

impl TmuxScanner {
    pub fn new(config: TmuxScannerConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
        }
    }

    pub async fn scan(&mut self, now_iso: &str, now_ms: i64) -> DaemonResult<Vec<Session>> {
        let _timer = Timer::new(&METRICS.scanner_tick);
        let windows = self.list_windows().await?;
        let mut sessions = Vec::with_capacity(windows.len());

        for window in windows {
            if !self.is_tracked(&window) {
                continue;
            }

            let target = format!("{}:{}", window.session_name, window.window_id);
            let capture = self.capture_pane(&target).await.unwrap_or_default();
            let dims = pane_dims(&capture);

            let cache_entry = self.cache.entry(target.clone()).or_default();
            let status_input = StatusInput {
                prev_capture: if cache_entry.last_capture.is_empty() {
                    None
                } else {
                    Some(cache_entry.last_capture.as_str())
                },
                prev_dims: cache_entry.last_capture_dims,
                next_capture: &capture,
                next_dims: dims,
                grace_started_at_ms: cache_entry
                    .grace_started_at
                    .as_deref()
                    .and_then(|s| s.parse().ok()),
                now_ms,
            };
            let result = infer_session_status(status_input, self.config.status);

            // `last_changed_at` must only advance when the pane content
            // genuinely changed, never on every scan tick and never merely
            // because we're still inside the post-change working-grace
            // window. The first observation of a window also counts as a
            // change so `last_activity` has something to report immediately.
            let is_genuine_change = cache_entry.last_changed_at.is_none() || result.reason == "output-changed";

            cache_entry.last_capture = capture.clone();
            cache_entry.last_capture_dims = Some(dims);
            cache_entry.grace_started_at = result.grace_started_at_ms.map(|ms| ms.to_string());
            if is_genuine_change {
                cache_entry.last_changed_at = Some(now_iso.to_string());
            }
            let last_activity = cache_entry.last_changed_at.clone().unwrap_or_else(|| now_iso.to_string());

            let source = if window.session_name == self.config.tmux_session {
                SessionSource::Managed
            } else {
                SessionSource::External
            };

            let agent_type = infer_agent_type(&window.pane_start_command);
            let created_at = window_created_at(window.window_activity, now_iso);

            sessions.push(Session {
                id: Session::local_id(&window.session_name, &window.window_id),
                name: match source {
                    SessionSource::Managed => window.window_name.clone(),
                    SessionSource::External => window.session_name.clone(),
                },
                tmux_target: target,
                project_path: if window.pane_current_path.is_empty() {
                    None
                } else {
                    Some(window.pane_current_path)
                },
                status: result.status,
                last_activity,
                created_at,
                source,
                host: None,
                remote: false,
                start_command: if window.pane_start_command.is_empty() {
                    None
                } else {
                    Some(window.pane_start_command)
                },
                agent_type,
            });
        }

        let live_targets: std::collections::HashSet<String> =
            sessions.iter().map(|s| s.tmux_target.clone()).collect();
        self.cache.retain(|target, _| live_targets.contains(target));

        Ok(sessions)
    }

    /// Build the candidate windows the log poller needs to match live
    /// windows against discovered log files, using whatever was captured on
    /// the most recent `scan()` — call after `scan()`, not before.
    pub fn candidates(&self) -> Vec<crate::logs::matcher::WindowCandidate> {
        self.cache
            .iter()
            .map(|(target, state)| {
                let submitted_messages = extract_recent_user_messages(&state.last_capture, RECENT_MESSAGE_LIMIT);
                let fallback_trace_line = if submitted_messages.is_empty() {
                    state.last_capture.lines().rev().find(|line| !line.trim().is_empty()).map(str::to_string)
                } else {
                    None
                };
                crate::logs::matcher::WindowCandidate {
                    tmux_target: target.clone(),
                    submitted_messages,
                    fallback_trace_line,
                }
            })
            .collect()
    }

    fn is_tracked(&self, window: &TmuxWindow) -> bool {
        if window.session_name == self.config.tmux_session {
            return true;
        }
        self.config
            .discover_prefixes
            .iter()
            .any(|prefix| window.window_name.starts_with(prefix.as_str()))
    }

    async fn list_windows(&self) -> DaemonResult<Vec<TmuxWindow>> {
        match run_tmux(&["list-windows", "-a", "-F", LIST_WINDOWS_FORMAT]).await {
            Ok(output) => Ok(parse_list_windows(&output, true)),
            Err(_) => {
                let output = run_tmux(&["list-windows", "-a", "-F", LIST_WINDOWS_FORMAT_FALLBACK]).await?;
                Ok(parse_list_windows(&output, false))
            }
        }
    }

    async fn capture_pane(&self, target: &str) -> DaemonResult<String> {
        let raw = run_tmux(&["capture-pane", "-t", target, "-p", "-J"]).await?;
        Ok(trim_to_last_lines(&raw, CAPTURE_LINE_CAP))
    }
}

/// `createdAt = ISO(windowCreationTime * 1000)` when the tmux server
/// reported a window activity timestamp, else `now`.
fn window_created_at(window_activity: Option<i64>, now_iso: &str) -> String {
    window_activity
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| now_iso.to_string())
}

fn parse_list_windows(output: &str, has_activity: bool) -> Vec<TmuxWindow> {
    output
        .lines()
        .filter_map(|line| {
            let field_count = if has_activity { 7 } else { 6 };
            let mut fields = line.splitn(field_count, '\t');
            let session_name = fields.next()?.to_string();
            let window_id = fields.next()?.to_string();
            let window_name = fields.next()?.to_string();
            let pane_current_path = fields.next().unwrap_or("").to_string();
            let pane_start_command = fields.next().unwrap_or("").to_string();
            let _pane_id = fields.next().unwrap_or("");
            let window_activity = if has_activity {
                fields.next().and_then(|s| s.trim().parse::<i64>().ok())
            } else {
                None
            };
            Some(TmuxWindow {
                session_name,
                window_id,
                window_name,
                pane_current_path,
                pane_start_command,
                window_activity,
            })
        })
        .collect()
}

fn trim_to_last_lines(raw: &str, max_lines: usize) -> String {
    let trimmed = raw.trim_end();
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() <= max_lines {
        trimmed.to_string()
    } else {
        lines[lines.len() - max_lines..].join("\n")
    }
}

/// Parse the 3-field `session\twindow_id\twindow_name` format used by the
/// remote poller's lighter-weight ssh listing.
pub fn parse_simple_windows(output: &str) -> Vec<(String, String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '\t');
            Some((
                fields.next()?.to_string(),
                fields.next()?.to_string(),
                fields.next().unwrap_or("").to_string(),
            ))
        })
        .collect()
}

fn pane_dims(capture: &str) -> (u16, u16) {
    let height = capture.lines().count() as u16;
    let width = capture.lines().map(str::len).max().unwrap_or(0) as u16;
    (width, height)
}

async fn run_tmux(args: &[&str]) -> DaemonResult<String> {
    let fut = Command::new("tmux").args(args).output();
    let output = timeout(TMUX_TIMEOUT, fut)
        .await
        .map_err(|_| DaemonError::Tmux(format!("timed out running tmux {args:?}")))?
        .map_err(|e| DaemonError::Tmux(e.to_string()))?;

    if !output.status.success() {
        return Err(DaemonError::Tmux(format!(
            "tmux {args:?} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
