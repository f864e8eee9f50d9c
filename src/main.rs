use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use clap::{Parser, Subcommand};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use agentboard::bus::{DaemonEvent, DaemonEventType, EventBus, SessionsChange, SessionsChangeKind};
use agentboard::cli::{self, OutputFormat};
use agentboard::collector::{RemoteConfig, RemotePoller, TmuxScanner, TmuxScannerConfig};
use agentboard::config::ConfigManager;
use agentboard::db;
use agentboard::detector::StatusConfig;
use agentboard::logging;
use agentboard::logs::poller::{LogPoller, LogPollerConfig};
use agentboard::reconcile::{self, ForceWorkingOverrides, ResumeTemplates, TmuxWindowSpawner};
use agentboard::registry::Registry;
use agentboard::rpc::RpcContext;
use agentboard::service::{self, InstanceGuard, ShutdownHandler};
use agentboard::transport::http::{HttpConfig, HttpServer};
use agentboard::transport::ws::{WsConfig, WsServer};

#[derive(Debug, Parser)]
#[command(
    name = "agentboard",
    version,
    about = "Agentboard daemon: tracks agent CLI sessions across tmux windows and hosts"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default if no subcommand is given).
    Start {
        /// Path to daemon.toml. Falls back to AGENTBOARD_CONFIG / XDG search / defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the WebSocket port from config.
        #[arg(long)]
        ws_port: Option<u16>,
        /// Override the HTTP port from config.
        #[arg(long)]
        http_port: Option<u16>,
    },
    /// Report whether the daemon is reachable and for how long it's been up.
    Health(ClientArgs),
    /// List the daemon's current fused session view.
    Status(ClientArgs),
    /// Run the daemon's internal self-test checks.
    SelfTest(ClientArgs),
    /// Print the daemon's active configuration.
    Config(ClientArgs),
    /// Send SIGTERM to a running daemon.
    Stop {
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Args)]
struct ClientArgs {
    #[arg(long, default_value_t = cli::DEFAULT_PORT)]
    port: u16,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    admin_token: Option<String>,
}

impl ClientArgs {
    fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn run_client_command(result: Result<(), agentboard::cli::CliError>) {
    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (config_override, ws_port, http_port) = match args.command {
        None => (None, None, None),
        Some(Command::Start { config, ws_port, http_port }) => (config, ws_port, http_port),
        Some(Command::Health(client)) => {
            run_client_command(cli::cmd_health(client.port, client.format(), client.admin_token));
            return;
        }
        Some(Command::Status(client)) => {
            run_client_command(cli::cmd_status(client.port, client.format(), client.admin_token));
            return;
        }
        Some(Command::SelfTest(client)) => {
            run_client_command(cli::cmd_self_test(client.port, client.format(), client.admin_token));
            return;
        }
        Some(Command::Config(client)) => {
            run_client_command(cli::cmd_config(client.port, client.format(), client.admin_token));
            return;
        }
        Some(Command::Stop { pid_file }) => {
            run_client_command(cli::cmd_stop(pid_file));
            return;
        }
    };

    let config_manager = match ConfigManager::load_from_fs(config_override) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("config error: {err}");
            std::process::exit(1);
        }
    };
    let config = config_manager.current();

    let _log_guard = logging::init(&config.logging);
    info!(version = agentboard::version(), "starting agentboard");

    let guard = match InstanceGuard::acquire() {
        Ok(guard) => guard,
        Err(err) => {
            error!(error = %err, "failed to acquire instance lock");
            std::process::exit(1);
        }
    };

    let db_path = config
        .storage
        .db_path
        .clone()
        .unwrap_or_else(|| service::data_dir().join("agentboard.db"));
    if let Some(parent) = db_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            warn!(error = %err, dir = %parent.display(), "could not create storage directory");
        }
    }

    let conn_rpc = match db::open_database(&db_path) {
        Ok(conn) => Arc::new(StdMutex::new(conn)),
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "failed to open database");
            std::process::exit(1);
        }
    };
    let conn_logs = match db::open_database(&db_path) {
        Ok(conn) => Arc::new(AsyncMutex::new(conn)),
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "failed to open database for log poller");
            std::process::exit(1);
        }
    };

    let bus = Arc::new(EventBus::new(512));
    let registry = Arc::new(Registry::new(bus.clone()));
    let overrides = Arc::new(ForceWorkingOverrides::new());

    let log_poller = Arc::new(AsyncMutex::new(LogPoller::new(
        LogPollerConfig {
            interval_ms: config.log_poll.poll_ms,
            poll_max: config.log_poll.poll_max,
            rg_threads: config.log_poll.rg_threads,
        },
        conn_logs.clone(),
        bus.clone(),
    )));
    let log_refresh = Arc::new(tokio::sync::Notify::new());

    let rpc_ctx = Arc::new(
        RpcContext::with_overrides(
            registry.clone(),
            conn_rpc.clone(),
            overrides.clone(),
            Arc::new(config.clone()),
        )
        .with_log_poller(log_poller.clone(), log_refresh.clone()),
    );

    // Startup reconciliation (§4.9 step 3): drop any persisted association
    // whose last submitted message no longer matches its claimed log file.
    {
        let tmux_config = TmuxScannerConfig {
            tmux_session: config.server.tmux_session.clone(),
            discover_prefixes: config.scanner.discover_prefixes.clone(),
            status: StatusConfig {
                working_grace_period_ms: config.scanner.working_grace_ms,
            },
        };
        let mut scanner = TmuxScanner::new(tmux_config);
        let iso = now_iso();
        match scanner.scan(&iso, now_ms()).await {
            Ok(sessions) => {
                let conn = conn_rpc.lock().expect("db mutex poisoned");
                let agent_sessions = db::list_agent_sessions(&conn).unwrap_or_default();
                let mut logs = agentboard::logs::discovery::discover_claude_logs().unwrap_or_default();
                logs.extend(agentboard::logs::discovery::discover_codex_logs().unwrap_or_default());
                let logs_by_session: std::collections::HashMap<
                    String,
                    agentboard::logs::discovery::DiscoveredLog,
                > = logs.into_iter().map(|l| (l.session_id.clone(), l)).collect();
                match reconcile::verify_associations_at_startup(
                    &conn,
                    &bus,
                    &agent_sessions,
                    &sessions,
                    &logs_by_session,
                    &iso,
                )
                .await
                {
                    Ok(n) => info!(checked = n, "startup association check complete"),
                    Err(err) => warn!(error = %err, "startup association check failed"),
                }
            }
            Err(err) => warn!(error = %err, "initial tmux scan failed, skipping startup reconciliation"),
        }
    }

    let shutdown = Arc::new(ShutdownHandler::new());

    // Last pane line per live window, refreshed by the scanner loop each
    // tick and read by the log poller loop so it can match windows against
    // log files without the two loops sharing a database connection.
    let candidates: Arc<StdMutex<Vec<agentboard::logs::matcher::WindowCandidate>>> =
        Arc::new(StdMutex::new(Vec::new()));

    // Local tmux scanner loop (§4.2/§4.9/§4.10/§4.12). Owns its own
    // connection (WAL mode allows this alongside conn_rpc/conn_logs) so the
    // async resurrection call never holds a lock guard across an `.await`.
    {
        let registry = registry.clone();
        let bus = bus.clone();
        let config = config.clone();
        let db_path = db_path.clone();
        let candidates = candidates.clone();
        let overrides = overrides.clone();
        let mut shutdown_rx = shutdown.subscribe();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(err) => {
                    error!(error = %err, "failed to build scanner loop runtime");
                    return;
                }
            };
            rt.block_on(async move {
            let conn = match db::open_database(&db_path) {
                Ok(conn) => conn,
                Err(err) => {
                    error!(error = %err, "scanner loop failed to open its database connection");
                    return;
                }
            };
            let tmux_config = TmuxScannerConfig {
                tmux_session: config.server.tmux_session.clone(),
                discover_prefixes: config.scanner.discover_prefixes.clone(),
                status: StatusConfig {
                    working_grace_period_ms: config.scanner.working_grace_ms,
                },
            };
            let mut scanner = TmuxScanner::new(tmux_config);
            let templates = ResumeTemplates {
                claude: config.resume.claude_resume_cmd.clone(),
                codex: config.resume.codex_resume_cmd.clone(),
            };
            let spawner = TmuxWindowSpawner {
                tmux_session: config.server.tmux_session.clone(),
            };
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                config.scanner.refresh_interval_ms,
            ));

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }

                let iso = now_iso();
                let ms = now_ms();
                match scanner.scan(&iso, ms).await {
                    Ok(sessions) => {
                        *candidates.lock().expect("candidates mutex poisoned") = scanner.candidates();

                        let live_targets: std::collections::HashSet<String> =
                            sessions.iter().map(|s| s.tmux_target.clone()).collect();

                        let agent_sessions = match db::list_agent_sessions(&conn) {
                            Ok(rows) => rows,
                            Err(err) => {
                                warn!(error = %err, "failed to list agent sessions");
                                Vec::new()
                            }
                        };

                        let (active, inactive): (Vec<_>, Vec<_>) = agent_sessions
                            .iter()
                            .cloned()
                            .partition(|row| row.current_window.is_some());
                        registry.set_agent_sessions(&active, &inactive, &iso);

                        if let Err(err) = reconcile::orphan_missing_windows(
                            &conn,
                            &bus,
                            &agent_sessions,
                            &live_targets,
                            &iso,
                        ) {
                            warn!(error = %err, "orphan sweep failed");
                        }
                        if let Err(err) = reconcile::resurrect_pinned_sessions(
                            &conn, &bus, &spawner, &templates, &iso,
                        )
                        .await
                        {
                            warn!(error = %err, "pinned-session resurrection failed");
                        }

                        let mut fused = reconcile::fuse_sessions(sessions, &agent_sessions);
                        overrides.apply(&mut fused, ms);
                        let plain: Vec<_> = fused.into_iter().map(|f| f.session).collect();

                        registry.replace_sessions(plain, &iso);
                    }
                    Err(err) => warn!(error = %err, "tmux scan failed"),
                }
            }
            });
        });
    }

    // Remote SSH poller loop (§4.11).
    if !config.remote.hosts.is_empty() {
        let registry = registry.clone();
        let bus = bus.clone();
        let config = config.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let remote_config = RemoteConfig {
                hosts: config.remote.hosts.clone(),
                poll_interval_ms: config.remote.poll_ms,
                timeout_ms: config.remote.timeout_ms,
                stale_ms: config.remote.stale_ms as i64,
                ssh_opts: config
                    .remote
                    .ssh_opts
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            };
            let poller = RemotePoller::new(remote_config);
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(config.remote.poll_ms));

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }

                let iso = now_iso();
                let results = poller.poll_tick(&iso).await;
                for (status, sessions) in results {
                    bus.publish_host_status(status);
                    for session in sessions {
                        registry.update_session(session, &iso);
                    }
                }
            }
        });
    }

    // Log poller loop (§4.8): keeps `agent_sessions` matched against live
    // windows. Shares its `LogPoller` with the WS/HTTP transports via
    // `rpc_ctx` so a just-submitted message can lock itself in and wake
    // this loop immediately instead of waiting out the poll interval.
    {
        let log_poller = log_poller.clone();
        let log_refresh = log_refresh.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let candidates = candidates.clone();
        tokio::spawn(async move {
            let interval_duration = log_poller.lock().await.interval();
            let mut interval = tokio::time::interval(interval_duration);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = log_refresh.notified() => {}
                    _ = shutdown_rx.recv() => break,
                }

                let snapshot = candidates.lock().expect("candidates mutex poisoned").clone();

                let iso = now_iso();
                let mut poller = log_poller.lock().await;
                if let Err(err) = poller.tick(&snapshot, &iso, now_ms()).await {
                    warn!(error = %err, "log poll tick failed");
                }
            }
        });
    }

    // Forward registry/bus activity to WebSocket clients as notifications.
    // HTTP carries request/response RPC on `server.port` (what `agentboard
    // status`/`cli.rs` talk to); WS is the secondary push channel for live
    // dashboards, one port up by default.
    let ws_server = WsServer::new(WsConfig {
        port: ws_port.unwrap_or(config.server.port + 1),
        admin_token: read_admin_token(&config),
        tokens: Vec::new(),
        tmux_session: config.server.tmux_session.clone(),
        remote_hosts: config.remote.hosts.clone(),
        remote_ssh_opts: config.remote.ssh_opts.split_whitespace().map(str::to_string).collect(),
        remote_allow_control: config.remote.allow_control,
        resume_templates: ResumeTemplates {
            claude: config.resume.claude_resume_cmd.clone(),
            codex: config.resume.codex_resume_cmd.clone(),
        },
        working_grace_ms: config.scanner.working_grace_ms,
    });
    let notification_tx = ws_server.notification_sender();
    {
        let mut state_rx = bus.subscribe_state();
        let mut event_rx = bus.subscribe_events();
        let tx = notification_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok(change) = state_rx.recv() => {
                        let _ = tx.send(sessions_change_frame(change));
                    }
                    Ok(event) = event_rx.recv() => {
                        if let Some(frame) = daemon_event_frame(event) {
                            let _ = tx.send(frame);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                    else => break,
                }
            }
        });
    }

    let http_server = HttpServer::new(HttpConfig {
        port: http_port.unwrap_or(config.server.port),
        admin_token: read_admin_token(&config),
        tokens: Vec::new(),
    });

    let ws_ctx = rpc_ctx.clone();
    let http_ctx = rpc_ctx.clone();
    tokio::spawn(async move { ws_server.run(ws_ctx).await });
    tokio::spawn(async move { http_server.run(http_ctx).await });

    shutdown.wait_for_signal().await;
    info!("agentboard shutting down");
    drop(guard);
}

/// Translates a registry change into the flat push frame §4.14 names: a
/// whole-table resync becomes `sessions`, a single-row patch becomes
/// `session-update`. `session-removed` is not derived here — the registry
/// emits it directly on the event channel, one per dropped id.
fn sessions_change_frame(change: SessionsChange) -> serde_json::Value {
    match change.kind {
        SessionsChangeKind::Full => serde_json::json!({
            "type": "sessions",
            "sessions": change.sessions,
        }),
        SessionsChangeKind::Update => serde_json::json!({
            "type": "session-update",
            "session": change.sessions.into_iter().next(),
        }),
    }
}

/// Translates a bus event into its named push frame. `Custom` events carry
/// their own type name verbatim (currently just `session-removed`); the
/// typed variants map 1:1 onto §4.14's message list. Any object payload is
/// merged into the frame so e.g. a `host-status` event's already-shaped
/// `HostStatus` JSON becomes the frame's top-level fields.
fn daemon_event_frame(event: DaemonEvent) -> Option<serde_json::Value> {
    let type_name = match &event.event_type {
        DaemonEventType::SessionOrphaned => "session-orphaned",
        DaemonEventType::SessionActivated => "session-activated",
        DaemonEventType::SessionResurrectionFailed => "session-resurrection-failed",
        DaemonEventType::HostStatus => "host-status",
        DaemonEventType::AgentSessions => "agent-sessions",
        DaemonEventType::Custom(name) => name.as_str(),
    }
    .to_string();

    let mut frame = match event.payload {
        Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        Some(other) => serde_json::json!({ "payload": other }),
        None => serde_json::json!({}),
    };
    let map = frame.as_object_mut().expect("frame is always an object");
    map.insert("type".to_string(), serde_json::Value::String(type_name));
    if let Some(session_id) = event.session_id {
        map.entry("sessionId").or_insert(serde_json::Value::String(session_id));
    }
    Some(frame)
}

fn read_admin_token(config: &agentboard::config::DaemonConfig) -> Option<String> {
    let path = config.security.admin_token_path.as_ref()?;
    match std::fs::read_to_string(path) {
        Ok(token) => Some(token.trim().to_string()),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "could not read admin token file");
            None
        }
    }
}
