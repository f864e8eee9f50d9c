//! WebSocket transport: the live dashboard channel (§4.14). Carries the
//! same request/response RPC table as HTTP (`rpc::handle`) for reads, plus
//! a `type`-keyed message dispatcher for everything stateful per
//! connection — terminal attach/detach/input/resize, window create/kill/
//! rename, copy-mode control, pinning and resurrection.

use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::db;
use crate::error::{DaemonError, DaemonResult};
use crate::reconcile::{ResumeTemplates, TmuxWindowSpawner, WindowSpawner};
use crate::rpc::{self, RpcContext};
use crate::terminal::local::LocalTerminal;
use crate::terminal::ssh::SshTerminal;
use crate::terminal::{TerminalErrorKind, TerminalProxy};
use crate::transport::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Configuration for the WebSocket server.
#[derive(Clone, Debug)]
pub struct WsConfig {
    pub port: u16,
    pub admin_token: Option<String>,
    pub tokens: Vec<String>,
    /// The daemon's own managed tmux session — where `session-create`
    /// opens new local windows.
    pub tmux_session: String,
    /// Remote hosts allowed in `session-create`/`session-kill`'s
    /// `remoteAllowControl` check.
    pub remote_hosts: Vec<String>,
    pub remote_ssh_opts: Vec<String>,
    pub remote_allow_control: bool,
    pub resume_templates: ResumeTemplates,
    pub working_grace_ms: i64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            port: 3847,
            admin_token: None,
            tokens: Vec::new(),
            tmux_session: "agentboard".to_string(),
            remote_hosts: Vec::new(),
            remote_ssh_opts: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            remote_allow_control: false,
            resume_templates: ResumeTemplates::default(),
            working_grace_ms: 4_000,
        }
    }
}

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$").unwrap()
    })
}

fn window_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^:]+:@?\d+$").unwrap())
}

fn session_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{8,64}$").unwrap())
}

fn window_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w-]+$").unwrap())
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty() && host.len() <= 253 && hostname_re().is_match(host)
}

/// Connected client bookkeeping visible outside the per-connection task
/// (used by `authenticate`/future admin tooling, not by the dispatcher).
#[allow(dead_code)]
struct Client {
    addr: SocketAddr,
    is_admin: bool,
    subscriptions: Vec<String>,
}

/// Per-connection state (§4.14). `attach_seq` is shared with the PTY/ssh
/// output-forwarding task spawned by `terminal-attach` so a later
/// detach/re-attach can tell that task its output is stale.
struct ConnectionState {
    terminal: Option<Box<dyn TerminalProxy>>,
    current_session_id: Option<String>,
    #[allow(dead_code)]
    current_tmux_target: Option<String>,
    terminal_host: Option<String>,
    attach_seq: Arc<AtomicU64>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            terminal: None,
            current_session_id: None,
            current_tmux_target: None,
            terminal_host: None,
            attach_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn dispose_terminal(&mut self) {
        self.attach_seq.fetch_add(1, Ordering::SeqCst);
        if let Some(mut terminal) = self.terminal.take() {
            terminal.dispose().await;
        }
        self.current_session_id = None;
        self.current_tmux_target = None;
        self.terminal_host = None;
    }
}

pub struct WsServer {
    config: WsConfig,
    clients: Arc<RwLock<HashMap<SocketAddr, Client>>>,
    /// Flat `{"type": ...}` push frames (§4.14's server-to-client message
    /// list), fanned out to every connected client verbatim — the same
    /// envelope shape `dispatch()`'s own replies already use.
    notification_tx: broadcast::Sender<Value>,
}

impl WsServer {
    pub fn new(config: WsConfig) -> Self {
        let (notification_tx, _) = broadcast::channel(256);
        Self {
            config,
            clients: Arc::new(RwLock::new(HashMap::new())),
            notification_tx,
        }
    }

    pub fn notification_sender(&self) -> broadcast::Sender<Value> {
        self.notification_tx.clone()
    }

    pub async fn run(self, ctx: Arc<RpcContext>) {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, addr = %addr, "failed to bind WebSocket server");
                return;
            }
        };

        info!(addr = %addr, "WebSocket server listening");

        let server = Arc::new(self);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = server.clone();
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr, ctx).await {
                            debug!(addr = %addr, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<RpcContext>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        debug!(addr = %addr, "new WebSocket connection");

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let is_admin = false;

        {
            let mut clients = self.clients.write().await;
            clients.insert(
                addr,
                Client {
                    addr,
                    is_admin,
                    subscriptions: Vec::new(),
                },
            );
        }

        info!(addr = %addr, "WebSocket client connected");

        let mut notification_rx = self.notification_tx.subscribe();
        let (tx, mut rx) = mpsc::channel::<String>(32);

        let write_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = rx.recv() => {
                        if write.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(frame) = notification_rx.recv() => {
                        let _timer = crate::metrics::Timer::new(&crate::metrics::METRICS.ws_dispatch);
                        if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    else => break,
                }
            }
        });

        let mut client_ctx = (*ctx).clone();
        client_ctx.is_admin = is_admin;
        let mut state = ConnectionState::new();

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let text_str = text.to_string();
                    trace!(addr = %addr, msg = %text_str, "received message");
                    self.process_message(&text_str, &client_ctx, &mut state, &tx).await;
                }
                Ok(Message::Close(_)) => {
                    debug!(addr = %addr, "client sent close");
                    break;
                }
                Ok(Message::Ping(_)) => {}
                Ok(_) => {}
                Err(e) => {
                    debug!(addr = %addr, error = %e, "read error");
                    break;
                }
            }
        }

        state.dispose_terminal().await;
        drop(tx);
        write_task.abort();

        {
            let mut clients = self.clients.write().await;
            clients.remove(&addr);
        }

        info!(addr = %addr, "WebSocket client disconnected");
        Ok(())
    }

    /// Dispatches one incoming frame. JSON-RPC envelopes (`jsonrpc: "2.0"`)
    /// go through the shared `rpc::handle` table, matching HTTP. Everything
    /// else is a flat `{"type": ...}` frame handled by the §4.14 dispatcher.
    async fn process_message(
        &self,
        text: &str,
        ctx: &RpcContext,
        state: &mut ConnectionState,
        tx: &mpsc::Sender<String>,
    ) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse JSON");
                let response = JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(format!("Invalid JSON: {e}")),
                );
                send_json(tx, &response).await;
                return;
            }
        };

        if value.get("jsonrpc").and_then(Value::as_str) == Some("2.0") {
            self.process_rpc(value, ctx, tx).await;
            return;
        }

        let Some(msg_type) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
            send_error(tx, "missing message type").await;
            return;
        };

        self.dispatch(&msg_type, value, ctx, state, tx).await;
    }

    async fn process_rpc(&self, value: Value, ctx: &RpcContext, tx: &mpsc::Sender<String>) {
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                send_json(
                    tx,
                    &JsonRpcResponse::error(Value::Null, JsonRpcError::invalid_request(e.to_string())),
                )
                .await;
                return;
            }
        };

        let id = match request.id {
            Some(id) => id,
            None => {
                debug!(method = %request.method, "received notification (no response)");
                let _ = rpc::handle(&request.method, request.params, ctx);
                return;
            }
        };

        debug!(method = %request.method, "handling request");
        let result = rpc::handle(&request.method, request.params, ctx);
        let response = match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, JsonRpcError::from_rpc_error(&e)),
        };
        send_json(tx, &response).await;
    }

    async fn dispatch(
        &self,
        msg_type: &str,
        value: Value,
        ctx: &RpcContext,
        state: &mut ConnectionState,
        tx: &mpsc::Sender<String>,
    ) {
        match msg_type {
            "session-refresh" => {
                let sessions = ctx.registry.snapshot();
                send_frame(tx, json!({ "type": "sessions", "sessions": sessions })).await;
            }
            "session-create" => self.handle_session_create(value, ctx, tx).await,
            "session-kill" => self.handle_session_kill(value, ctx, tx).await,
            "session-rename" => self.handle_session_rename(value, ctx, tx).await,
            "terminal-attach" => self.handle_terminal_attach(value, state, tx).await,
            "terminal-detach" => self.handle_terminal_detach(value, state).await,
            "terminal-input" => self.handle_terminal_input(value, ctx, state, tx).await,
            "terminal-resize" => self.handle_terminal_resize(value, state, tx).await,
            "tmux-cancel-copy-mode" => self.handle_cancel_copy_mode(value, tx).await,
            "tmux-check-copy-mode" => self.handle_check_copy_mode(value, tx).await,
            "session-resume" => self.handle_session_resume(value, ctx, tx).await,
            "session-pin" => self.handle_session_pin(value, ctx, tx).await,
            other => {
                send_error(tx, &format!("unknown message type: {other}")).await;
            }
        }
    }

    async fn handle_session_create(&self, value: Value, ctx: &RpcContext, tx: &mpsc::Sender<String>) {
        let project_path = value.get("projectPath").and_then(Value::as_str).unwrap_or(".");
        let window_name = value.get("windowName").and_then(Value::as_str);
        let remote_host = value.get("host").and_then(Value::as_str);

        let result = match remote_host {
            None => create_local_window(&self.config.tmux_session, project_path, window_name).await,
            Some(host) => {
                if !is_valid_hostname(host) {
                    send_error(tx, "invalid_hostname").await;
                    return;
                }
                if !self.config.remote_hosts.iter().any(|h| h == host) {
                    send_error(tx, "host not in allow-list").await;
                    return;
                }
                create_remote_window(host, &self.config.remote_ssh_opts, &self.config.tmux_session, project_path, window_name).await
            }
        };

        match result {
            Ok((tmux_target, window_id)) => {
                let id = match remote_host {
                    None => tmux_target.clone(),
                    Some(host) => crate::models::Session::remote_id(host, &self.config.tmux_session, &window_id),
                };
                let session = crate::models::Session {
                    id,
                    name: window_name.unwrap_or(&window_id).to_string(),
                    tmux_target: tmux_target.clone(),
                    project_path: Some(project_path.to_string()),
                    status: crate::models::SessionStatus::Unknown,
                    last_activity: String::new(),
                    created_at: String::new(),
                    source: crate::models::SessionSource::Managed,
                    host: remote_host.map(str::to_string),
                    remote: remote_host.is_some(),
                    start_command: None,
                    agent_type: crate::models::AgentType::Unknown,
                };
                // Optimistic registry update (§4.14) ahead of the next
                // scanner tick; the scanner's own observation will
                // overwrite this with authoritative status shortly after.
                ctx.registry.update_session(session, "");
                send_frame(tx, json!({ "type": "session-created", "tmuxTarget": tmux_target })).await;
            }
            Err(err) => send_error(tx, &err.to_string()).await,
        }
    }

    async fn handle_session_kill(&self, value: Value, ctx: &RpcContext, tx: &mpsc::Sender<String>) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            send_error(tx, "sessionId is required").await;
            return;
        };
        let Some(session) = ctx.registry.get(session_id) else {
            send_error(tx, "no such session").await;
            return;
        };

        if session.remote && !self.config.remote_allow_control {
            send_frame(tx, json!({ "type": "kill-failed", "sessionId": session_id, "reason": "remote control disabled" })).await;
            return;
        }

        let result = match &session.host {
            Some(host) => kill_remote_window(host, &self.config.remote_ssh_opts, &session.tmux_target).await,
            None => kill_local_window(&session.tmux_target).await,
        };

        match result {
            Ok(()) => {
                ctx.registry.remove(session_id, "");
                send_frame(tx, json!({ "type": "session-removed", "sessionId": session_id })).await;
            }
            Err(err) => {
                send_frame(tx, json!({ "type": "kill-failed", "sessionId": session_id, "reason": err.to_string() })).await;
            }
        }
    }

    async fn handle_session_rename(&self, value: Value, ctx: &RpcContext, tx: &mpsc::Sender<String>) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            send_error(tx, "sessionId is required").await;
            return;
        };
        let Some(name) = value.get("name").and_then(Value::as_str) else {
            send_error(tx, "name is required").await;
            return;
        };
        if !window_name_re().is_match(name) {
            send_error(tx, "invalid_window_name").await;
            return;
        }
        let Some(session) = ctx.registry.get(session_id) else {
            send_error(tx, "no such session").await;
            return;
        };
        if ctx.registry.snapshot().iter().any(|s| s.id != session_id && s.name == name) {
            send_error(tx, "duplicate name").await;
            return;
        }

        match rename_local_window(&session.tmux_target, name).await {
            Ok(()) => {
                let mut updated = session;
                updated.name = name.to_string();
                ctx.registry.update_session(updated, "");
                send_frame(tx, json!({ "type": "session-update", "sessionId": session_id, "name": name })).await;
            }
            Err(err) => send_error(tx, &err.to_string()).await,
        }
    }

    async fn handle_terminal_attach(&self, value: Value, state: &mut ConnectionState, tx: &mpsc::Sender<String>) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str).map(str::to_string) else {
            send_error(tx, "sessionId is required").await;
            return;
        };
        let Some(tmux_target) = value.get("tmuxTarget").and_then(Value::as_str).map(str::to_string) else {
            send_error(tx, "tmuxTarget is required").await;
            return;
        };
        if !window_target_re().is_match(&tmux_target) {
            send_terminal_error(tx, &session_id, TerminalErrorKind::InvalidWindow, false).await;
            return;
        }
        let host = value.get("host").and_then(Value::as_str).map(str::to_string);

        let seq = state.attach_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let needs_new_proxy = state.terminal.is_none() || state.terminal_host != host;
        if needs_new_proxy {
            state.dispose_terminal().await;
            state.attach_seq.store(seq, Ordering::SeqCst);

            let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
            let mut terminal: Box<dyn TerminalProxy> = match &host {
                None => Box::new(LocalTerminal::new(&self.config.tmux_session, &session_id)),
                Some(h) => Box::new(SshTerminal::new(h, &self.config.remote_ssh_opts, &session_id)),
            };

            if let Err(err) = terminal.start(&tmux_target, output_tx).await {
                send_terminal_error(tx, &session_id, TerminalErrorKind::TmuxAttachFailed, true).await;
                warn!(error = %err, "terminal attach failed");
                return;
            }

            let attach_seq = state.attach_seq.clone();
            let forward_tx = tx.clone();
            let forward_session = session_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = output_rx.recv().await {
                    if attach_seq.load(Ordering::SeqCst) != seq {
                        break;
                    }
                    let payload = json!({
                        "type": "terminal-output",
                        "sessionId": forward_session,
                        "data": String::from_utf8_lossy(&chunk),
                    });
                    if forward_tx.send(payload.to_string()).await.is_err() {
                        break;
                    }
                }
            });

            state.terminal = Some(terminal);
            state.terminal_host = host;
        } else if let Some(terminal) = state.terminal.as_mut() {
            if let Err(err) = terminal.switch_to(&tmux_target).await {
                send_terminal_error(tx, &session_id, TerminalErrorKind::TmuxSwitchFailed, true).await;
                warn!(error = %err, "terminal switch failed");
                return;
            }
        }

        if state.attach_seq.load(Ordering::SeqCst) != seq {
            return;
        }

        state.current_session_id = Some(session_id.clone());
        state.current_tmux_target = Some(tmux_target.clone());

        let scrollback = capture_scrollback(&tmux_target).await.unwrap_or_default();
        if state.attach_seq.load(Ordering::SeqCst) != seq {
            return;
        }
        send_frame(tx, json!({ "type": "terminal-output", "sessionId": session_id, "data": scrollback })).await;
        send_frame(tx, json!({ "type": "terminal-ready", "sessionId": session_id })).await;
    }

    async fn handle_terminal_detach(&self, value: Value, state: &mut ConnectionState) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        if state.current_session_id.as_deref() == Some(session_id) {
            state.dispose_terminal().await;
        }
    }

    async fn handle_terminal_input(
        &self,
        value: Value,
        ctx: &RpcContext,
        state: &mut ConnectionState,
        tx: &mpsc::Sender<String>,
    ) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        if state.current_session_id.as_deref() != Some(session_id) {
            return;
        }
        let Some(data) = value.get("data").and_then(Value::as_str) else {
            return;
        };

        if let Some(terminal) = state.terminal.as_mut() {
            if let Err(err) = terminal.write(data.as_bytes()).await {
                send_terminal_error(tx, session_id, TerminalErrorKind::TmuxAttachFailed, true).await;
                warn!(error = %err, "terminal write failed");
                return;
            }
        }

        if state.terminal_host.is_none() && (data.contains('\r') || data.contains('\n')) {
            let now_ms = chrono::Utc::now().timestamp_millis();
            ctx.force_working.trigger(session_id, now_ms, self.config.working_grace_ms);

            if let Some(log_poller) = &ctx.log_poller {
                log_poller.lock().await.lock_last_user_message(session_id, now_ms);
                ctx.log_refresh.notify_one();
            }
        }
    }

    async fn handle_terminal_resize(&self, value: Value, state: &mut ConnectionState, tx: &mpsc::Sender<String>) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            return;
        };
        if state.current_session_id.as_deref() != Some(session_id) {
            return;
        }
        let cols = value.get("cols").and_then(Value::as_u64).unwrap_or(80) as u16;
        let rows = value.get("rows").and_then(Value::as_u64).unwrap_or(24) as u16;

        if let Some(terminal) = state.terminal.as_mut() {
            if let Err(err) = terminal.resize(cols, rows).await {
                warn!(error = %err, "terminal resize failed");
                send_terminal_error(tx, session_id, TerminalErrorKind::TmuxAttachFailed, true).await;
            }
        }
    }

    async fn handle_cancel_copy_mode(&self, value: Value, tx: &mpsc::Sender<String>) {
        let Some(target) = value.get("tmuxTarget").and_then(Value::as_str) else {
            send_error(tx, "tmuxTarget is required").await;
            return;
        };
        let _ = run_tmux(&["send-keys", "-X", "-t", target, "cancel"]).await;
    }

    async fn handle_check_copy_mode(&self, value: Value, tx: &mpsc::Sender<String>) {
        let Some(target) = value.get("tmuxTarget").and_then(Value::as_str) else {
            send_error(tx, "tmuxTarget is required").await;
            return;
        };
        let in_mode = match run_tmux(&["display-message", "-p", "-t", target, "#{pane_in_mode}"]).await {
            Ok(output) => output.trim() == "1",
            Err(_) => false,
        };
        send_frame(tx, json!({ "type": "tmux-copy-mode-status", "tmuxTarget": target, "inCopyMode": in_mode })).await;
    }

    async fn handle_session_resume(&self, value: Value, ctx: &RpcContext, tx: &mpsc::Sender<String>) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            send_error(tx, "sessionId is required").await;
            return;
        };
        if !session_id_re().is_match(session_id) {
            send_error(tx, "invalid_session_id").await;
            return;
        }

        let row_result = {
            let conn = ctx.conn.lock().expect("db mutex poisoned");
            db::get_agent_session(&conn, session_id)
        };
        let row = match row_result {
            Ok(Some(row)) => row,
            Ok(None) => {
                send_error(tx, "no such agent session").await;
                return;
            }
            Err(err) => {
                send_error(tx, &err.to_string()).await;
                return;
            }
        };

        if row.current_window.is_some() {
            send_frame(
                tx,
                json!({ "type": "session-resume-result", "sessionId": session_id, "ok": false, "reason": "already active" }),
            )
            .await;
            return;
        }

        let spawner = TmuxWindowSpawner { tmux_session: self.config.tmux_session.clone() };
        let command = self.config.resume_templates.command_for(row.agent_type, session_id);
        let project_path = row.project_path.clone().unwrap_or_else(|| ".".to_string());

        match spawner.spawn_window(&project_path, &command).await {
            Ok(window) => {
                let mut updated = row;
                updated.current_window = Some(window.clone());
                updated.last_resume_error = None;
                {
                    let conn = ctx.conn.lock().expect("db mutex poisoned");
                    let _ = db::upsert_agent_session(&conn, &updated);
                }
                send_frame(
                    tx,
                    json!({ "type": "session-resume-result", "sessionId": session_id, "ok": true, "tmuxTarget": window }),
                )
                .await;
            }
            Err(err) => {
                {
                    let conn = ctx.conn.lock().expect("db mutex poisoned");
                    let _ = db::set_resume_error(&conn, session_id, Some(&err.to_string()));
                }
                send_frame(
                    tx,
                    json!({ "type": "session-resume-result", "sessionId": session_id, "ok": false, "reason": err.to_string() }),
                )
                .await;
            }
        }
    }

    async fn handle_session_pin(&self, value: Value, ctx: &RpcContext, tx: &mpsc::Sender<String>) {
        let Some(session_id) = value.get("sessionId").and_then(Value::as_str) else {
            send_error(tx, "sessionId is required").await;
            return;
        };
        let Some(is_pinned) = value.get("isPinned").and_then(Value::as_bool) else {
            send_error(tx, "isPinned is required").await;
            return;
        };

        let result: DaemonResult<()> = {
            let conn = ctx.conn.lock().expect("db mutex poisoned");
            (|| {
                db::get_agent_session(&conn, session_id)?.ok_or_else(|| {
                    DaemonError::NotFound(format!("no agent session {session_id}"))
                })?;
                db::set_pinned(&conn, session_id, is_pinned)
            })()
        };

        match result {
            Ok(()) => {
                send_frame(tx, json!({ "type": "session-pin-result", "sessionId": session_id, "isPinned": is_pinned })).await;
            }
            Err(err) => send_error(tx, &err.to_string()).await,
        }
    }

    #[allow(dead_code)]
    fn authenticate(&self, token: &str) -> Option<bool> {
        if let Some(admin_token) = &self.config.admin_token {
            if token == admin_token {
                return Some(true);
            }
        }
        if self.config.tokens.contains(&token.to_string()) {
            return Some(false);
        }
        None
    }
}

async fn send_json(tx: &mpsc::Sender<String>, response: &JsonRpcResponse) {
    if let Ok(json) = serde_json::to_string(response) {
        let _ = tx.send(json).await;
    }
}

async fn send_frame(tx: &mpsc::Sender<String>, frame: Value) {
    let _ = tx.send(frame.to_string()).await;
}

async fn send_error(tx: &mpsc::Sender<String>, message: &str) {
    send_frame(tx, json!({ "type": "error", "message": message })).await;
}

async fn send_terminal_error(tx: &mpsc::Sender<String>, session_id: &str, kind: TerminalErrorKind, retryable_override: bool) {
    send_frame(
        tx,
        json!({
            "type": "terminal-error",
            "sessionId": session_id,
            "code": kind.code(),
            "retryable": kind.retryable() || retryable_override,
        }),
    )
    .await;
}

const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

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

/// Creates a window atomically and verifies it actually exists (§6's
/// invariant: `new-window -P` can report success for a command that
/// exits immediately on some platforms, so confirm with `has-session`).
async fn create_local_window(
    tmux_session: &str,
    project_path: &str,
    window_name: Option<&str>,
) -> DaemonResult<(String, String)> {
    let mut args: Vec<String> = vec!["new-window".into(), "-t".into(), format!("{tmux_session}:"), "-P".into(), "-F".into(), "#{window_id}".into(), "-c".into(), project_path.into()];
    if let Some(name) = window_name {
        args.push("-n".into());
        args.push(name.into());
    }
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let window_id = run_tmux(&args_ref).await?.trim().to_string();
    let target = format!("{tmux_session}:{window_id}");

    run_tmux(&["has-session", "-t", &target]).await?;
    Ok((target, window_id))
}

async fn create_remote_window(
    host: &str,
    ssh_opts: &[String],
    tmux_session: &str,
    project_path: &str,
    window_name: Option<&str>,
) -> DaemonResult<(String, String)> {
    let mut remote_cmd = format!("tmux new-window -t {tmux_session}: -P -F '#{{window_id}}' -c {project_path}");
    if let Some(name) = window_name {
        remote_cmd = format!("{remote_cmd} -n {name}");
    }
    let mut args: Vec<String> = ssh_opts.to_vec();
    args.push(host.to_string());
    args.push(remote_cmd);
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();

    let fut = Command::new("ssh").args(&args_ref).output();
    let output = timeout(TMUX_TIMEOUT, fut)
        .await
        .map_err(|_| DaemonError::Ssh(format!("ssh to {host} timed out")))?
        .map_err(|e| DaemonError::Ssh(e.to_string()))?;
    if !output.status.success() {
        return Err(DaemonError::Ssh(format!("ssh {host} exited with {}", output.status)));
    }
    let window_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((format!("{tmux_session}:{window_id}"), window_id))
}

async fn kill_local_window(target: &str) -> DaemonResult<()> {
    run_tmux(&["kill-window", "-t", target]).await?;
    Ok(())
}

async fn kill_remote_window(host: &str, ssh_opts: &[String], target: &str) -> DaemonResult<()> {
    let mut args: Vec<String> = ssh_opts.to_vec();
    args.push(host.to_string());
    args.push(format!("tmux kill-window -t {target}"));
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let fut = Command::new("ssh").args(&args_ref).output();
    let output = timeout(TMUX_TIMEOUT, fut)
        .await
        .map_err(|_| DaemonError::Ssh(format!("ssh to {host} timed out")))?
        .map_err(|e| DaemonError::Ssh(e.to_string()))?;
    if !output.status.success() {
        return Err(DaemonError::Ssh(format!("ssh {host} exited with {}", output.status)));
    }
    Ok(())
}

async fn rename_local_window(target: &str, name: &str) -> DaemonResult<()> {
    run_tmux(&["rename-window", "-t", target, name]).await?;
    Ok(())
}

async fn capture_scrollback(target: &str) -> DaemonResult<String> {
    run_tmux(&["capture-pane", "-t", target, "-p", "-J", "-S", "-", "-E", "-"]).await
}
