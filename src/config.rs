use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub port: u16,
    pub hostname: String,
    pub tmux_session: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4040,
            hostname: "0.0.0.0".to_string(),
            tmux_session: "agentboard".to_string(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScannerConfig {
    pub refresh_interval_ms: u64,
    pub discover_prefixes: Vec<String>,
    pub prune_ws_sessions: bool,
    pub terminal_mode: String,
    pub working_grace_ms: i64,
    pub enter_refresh_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 2_000,
            discover_prefixes: Vec::new(),
            prune_ws_sessions: true,
            terminal_mode: "pty".to_string(),
            working_grace_ms: 4_000,
            enter_refresh_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogPollConfig {
    pub poll_ms: u64,
    pub poll_max: usize,
    pub rg_threads: usize,
}

impl Default for LogPollConfig {
    fn default() -> Self {
        Self {
            poll_ms: 5_000,
            poll_max: 25,
            rg_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RemoteConfig {
    pub hosts: Vec<String>,
    pub poll_ms: u64,
    pub timeout_ms: u64,
    pub stale_ms: u64,
    pub ssh_opts: String,
    pub allow_control: bool,
    pub allow_attach: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            poll_ms: 2_000,
            timeout_ms: 4_000,
            stale_ms: 6_000,
            ssh_opts: String::new(),
            allow_control: false,
            allow_attach: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResumeConfig {
    pub claude_resume_cmd: String,
    pub codex_resume_cmd: String,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            claude_resume_cmd: "claude --resume {sessionId}".to_string(),
            codex_resume_cmd: "codex resume {sessionId}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
#[derive(Default)]
pub struct SecurityConfig {
    pub admin_token_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
#[derive(Default)]
pub struct PrivacyConfig {
    pub redaction_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub max_file_mb: u64,
    pub max_files: usize,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_mb: 10,
            max_files: 5,
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    pub db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
#[derive(Default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub scanner: ScannerConfig,
    pub log_poll: LogPollConfig,
    pub remote: RemoteConfig,
    pub resume: ResumeConfig,
    pub security: SecurityConfig,
    pub privacy: PrivacyConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

impl DaemonConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::new(format!("TOML parse error: {err}")))
    }

    pub fn apply_env_overrides(&mut self) {
        env_u16("PORT", &mut self.server.port);
        env_string("HOSTNAME", &mut self.server.hostname);
        env_string("TMUX_SESSION", &mut self.server.tmux_session);
        env_path_opt("TLS_CERT", &mut self.server.tls_cert);
        env_path_opt("TLS_KEY", &mut self.server.tls_key);

        env_u64("REFRESH_INTERVAL_MS", &mut self.scanner.refresh_interval_ms);
        if let Ok(prefixes) = env::var("DISCOVER_PREFIXES") {
            self.scanner.discover_prefixes = split_csv(&prefixes);
        }
        env_bool("PRUNE_WS_SESSIONS", &mut self.scanner.prune_ws_sessions);
        env_string("TERMINAL_MODE", &mut self.scanner.terminal_mode);
        env_i64("AGENTBOARD_WORKING_GRACE_MS", &mut self.scanner.working_grace_ms);
        env_u64("AGENTBOARD_ENTER_REFRESH_MS", &mut self.scanner.enter_refresh_ms);

        env_u64("AGENTBOARD_LOG_POLL_MS", &mut self.log_poll.poll_ms);
        env_usize("AGENTBOARD_LOG_POLL_MAX", &mut self.log_poll.poll_max);
        env_usize("AGENTBOARD_RG_THREADS", &mut self.log_poll.rg_threads);

        if let Ok(hosts) = env::var("AGENTBOARD_REMOTE_HOSTS") {
            self.remote.hosts = split_csv(&hosts);
        }
        env_u64("AGENTBOARD_REMOTE_POLL_MS", &mut self.remote.poll_ms);
        env_u64("AGENTBOARD_REMOTE_TIMEOUT_MS", &mut self.remote.timeout_ms);
        env_u64("AGENTBOARD_REMOTE_STALE_MS", &mut self.remote.stale_ms);
        env_string("AGENTBOARD_REMOTE_SSH_OPTS", &mut self.remote.ssh_opts);
        env_bool("AGENTBOARD_REMOTE_ALLOW_CONTROL", &mut self.remote.allow_control);
        env_bool("AGENTBOARD_REMOTE_ALLOW_ATTACH", &mut self.remote.allow_attach);

        env_string("CLAUDE_RESUME_CMD", &mut self.resume.claude_resume_cmd);
        env_string("CODEX_RESUME_CMD", &mut self.resume.codex_resume_cmd);

        if let Ok(patterns) = env::var("NTM_TRACKER_PRIVACY_REDACTION_PATTERNS") {
            let parsed = split_csv(&patterns);
            if !parsed.is_empty() {
                self.privacy.redaction_patterns = parsed;
            }
        }
        env_path_opt("AGENTBOARD_SECURITY_ADMIN_TOKEN_PATH", &mut self.security.admin_token_path);

        env_string("AGENTBOARD_LOG_LEVEL", &mut self.logging.level);
        env_string("AGENTBOARD_LOG_FORMAT", &mut self.logging.format);
        env_path_opt("AGENTBOARD_LOG_FILE", &mut self.logging.file);
        env_path_opt("AGENTBOARD_DB_PATH", &mut self.storage.db_path);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner.refresh_interval_ms < 250 {
            return Err(ConfigError::new("scanner.refresh-interval-ms must be >= 250"));
        }
        if self.scanner.refresh_interval_ms > 60_000 {
            return Err(ConfigError::new("scanner.refresh-interval-ms must be <= 60000"));
        }
        if !matches!(self.scanner.terminal_mode.as_str(), "pty" | "pipe-pane" | "auto") {
            return Err(ConfigError::new(
                "scanner.terminal-mode must be one of: pty, pipe-pane, auto",
            ));
        }

        if self.remote.stale_ms < self.remote.poll_ms.saturating_mul(3) {
            return Err(ConfigError::new(
                "remote.stale-ms must be >= 3x remote.poll-ms",
            ));
        }

        for pattern in &self.privacy.redaction_patterns {
            Regex::new(pattern).map_err(|err| {
                ConfigError::new(format!("Invalid redaction regex '{pattern}': {err}"))
            })?;
        }

        if let Some(path) = &self.security.admin_token_path {
            validate_token_file_permissions(path)?;
        }

        if self.logging.max_files == 0 {
            return Err(ConfigError::new("logging.max-files must be >= 1"));
        }

        if self.logging.format != "text" && self.logging.format != "json" {
            return Err(ConfigError::new(
                "logging.format must be either 'text' or 'json'",
            ));
        }

        Ok(())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

fn env_path_opt(key: &str, target: &mut Option<PathBuf>) {
    if let Ok(value) = env::var(key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            *target = Some(PathBuf::from(trimmed));
        }
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(value) = env::var(key) {
        *target = matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

fn env_u16(key: &str, target: &mut u16) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_i64(key: &str, target: &mut i64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_usize(key: &str, target: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

#[derive(Clone)]
pub struct ConfigManager {
    path: Option<PathBuf>,
    config: Arc<RwLock<DaemonConfig>>,
}

impl ConfigManager {
    pub fn load_from_fs(config_override: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = resolve_config_path(config_override);
        let mut config = if let Some(ref path) = path {
            let raw = fs::read_to_string(path).map_err(|err| {
                ConfigError::new(format!("Unable to read config '{}': {err}", path.display()))
            })?;
            DaemonConfig::from_toml_str(&raw)?
        } else {
            DaemonConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(Self {
            path,
            config: Arc::new(RwLock::new(config)),
        })
    }

    pub fn current(&self) -> DaemonConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reload(&self) -> Result<DaemonConfig, ConfigError> {
        let Some(path) = &self.path else {
            return Ok(self.current());
        };

        let raw = fs::read_to_string(path).map_err(|err| {
            ConfigError::new(format!("Unable to read config '{}': {err}", path.display()))
        })?;
        let mut config = DaemonConfig::from_toml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;

        let mut guard = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = config.clone();

        Ok(config)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self {
            path: None,
            config: Arc::new(RwLock::new(DaemonConfig::default())),
        }
    }
}

#[cfg(unix)]
pub async fn watch_sighup_for_reload(config: ConfigManager) -> Result<(), ConfigError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stream =
        signal(SignalKind::hangup()).map_err(|err| ConfigError::new(err.to_string()))?;
    while stream.recv().await.is_some() {
        match config.reload() {
            Ok(_) => tracing::info!("config reloaded via SIGHUP"),
            Err(err) => tracing::warn!(error = %err, "config reload via SIGHUP failed"),
        }
    }

    Ok(())
}

fn resolve_config_path(config_override: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = config_override {
        return Some(path);
    }

    if let Ok(path) = env::var("AGENTBOARD_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    let mut candidates = Vec::new();
    if let Some(home) = env::var_os("XDG_CONFIG_HOME").filter(|value| !value.is_empty()) {
        candidates.push(PathBuf::from(home).join("agentboard").join("daemon.toml"));
    } else if let Some(home) = env::var_os("HOME").filter(|value| !value.is_empty()) {
        candidates.push(
            PathBuf::from(home)
                .join(".config")
                .join("agentboard")
                .join("daemon.toml"),
        );
    }
    candidates.push(PathBuf::from("/etc/agentboard/daemon.toml"));

    candidates.into_iter().find(|path| path.exists())
}

#[cfg(unix)]
fn validate_token_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::metadata(path)
        .map_err(|err| ConfigError::new(format!("Unable to stat token file: {err}")))?;
    if !meta.is_file() {
        return Err(ConfigError::new("Admin token path is not a file"));
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(ConfigError::new(format!(
            "Admin token file permissions must be 0600 (got {:o})",
            mode
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_token_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_and_validate() {
        let mut config = DaemonConfig::default();
        config.apply_env_overrides();
        config.validate().expect("defaults validate");
    }

    #[test]
    fn server_defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4040);
        assert_eq!(config.hostname, "0.0.0.0");
        assert_eq!(config.tmux_session, "agentboard");
    }

    #[test]
    fn remote_stale_must_be_at_least_triple_poll() {
        let mut config = DaemonConfig::default();
        config.remote.poll_ms = 2_000;
        config.remote.stale_ms = 2_000;
        let err = config.validate().unwrap_err();
        assert!(err.message.contains("stale-ms"));
    }

    #[test]
    fn invalid_terminal_mode_rejected() {
        let mut config = DaemonConfig::default();
        config.scanner.terminal_mode = "xterm".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.message.contains("terminal-mode"));
    }

    #[test]
    fn invalid_redaction_regex_fails_validation() {
        let mut config = DaemonConfig::default();
        config.privacy.redaction_patterns = vec!["[unclosed".to_string()];
        let err = config.validate().expect_err("validation error");
        assert!(err.message.contains("Invalid redaction regex"));
    }

    #[test]
    fn full_toml_parse() {
        let config = DaemonConfig::from_toml_str(
            r#"
[server]
port = 9090
hostname = "127.0.0.1"
tmux-session = "myboard"

[scanner]
refresh-interval-ms = 1000
terminal-mode = "pipe-pane"

[remote]
hosts = ["box1", "box2"]
poll-ms = 3000
stale-ms = 9000

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.scanner.terminal_mode, "pipe-pane");
        assert_eq!(config.remote.hosts, vec!["box1", "box2"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result = DaemonConfig::from_toml_str("not valid {{toml");
        assert!(result.is_err());
        assert!(result.unwrap_err().message.contains("TOML parse error"));
    }

    #[test]
    fn config_manager_default_returns_defaults() {
        let mgr = ConfigManager::default();
        let config = mgr.current();
        assert_eq!(config.server.port, 4040);
        assert!(mgr.config_path().is_none());
    }

    #[test]
    fn config_manager_reload_without_path() {
        let mgr = ConfigManager::default();
        let result = mgr.reload().unwrap();
        assert_eq!(result.server.port, 4040);
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::new("test error message");
        assert_eq!(err.to_string(), "test error message");
    }
}
