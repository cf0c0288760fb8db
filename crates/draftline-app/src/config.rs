// Configuration loading and parsing (client.toml, credentials.toml).

use draftline_core::draft::PickRules;
use draftline_core::reconnect::ReconnectConfig;
use draftline_core::sync::TimerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Bundled copy of `defaults/client.toml`, used to seed the platform config
/// directory when the working directory has no config of its own.
const DEFAULT_CLIENT_TOML: &str = include_str!("../defaults/client.toml");

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub draft_id: String,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub timer: TimerSettings,
    pub rules: RulesConfig,
    pub transport: TransportConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub ws_url: String,
    pub api_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// No inbound frame for this long marks the transport stale.
    pub ack_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        let interval = Duration::from_secs(25);
        Self {
            interval,
            ack_timeout: interval * 2 + Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSettings {
    /// Prediction tick cadence.
    pub tick: Duration,
    pub engine: TimerConfig,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            engine: TimerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RulesConfig {
    pub pick: PickRules,
    pub pre_draft_countdown: Duration,
    /// Synthesize the automatic pick locally when a turn's grace window ends.
    pub local_auto_pick: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            pick: PickRules::default(),
            pre_draft_countdown: Duration::from_secs(10),
            local_auto_pick: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Push-channel connection attempts before falling back to polling.
    pub probe_attempts: u32,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            probe_attempts: 3,
            probe_timeout: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(2000),
        }
    }
}

// ---------------------------------------------------------------------------
// client.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire client.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ClientFile {
    server: ServerConfig,
    draft: DraftSection,
    #[serde(default)]
    reconnect: ReconnectSection,
    #[serde(default)]
    heartbeat: HeartbeatSection,
    #[serde(default)]
    timer: TimerSection,
    #[serde(default)]
    rules: RulesSection,
    #[serde(default)]
    transport: TransportSection,
}

#[derive(Debug, Clone, Deserialize)]
struct DraftSection {
    draft_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ReconnectSection {
    base_delay_ms: u64,
    max_delay_ms: u64,
    fast_retry_delay_ms: u64,
    max_attempts: Option<u32>,
    fast_retry_codes: Vec<u16>,
    retry_on_going_away: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            fast_retry_delay_ms: defaults.fast_retry_delay.as_millis() as u64,
            max_attempts: defaults.max_attempts,
            fast_retry_codes: defaults.fast_retry_codes,
            retry_on_going_away: defaults.retry_on_going_away,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct HeartbeatSection {
    interval_secs: u64,
    ack_timeout_secs: Option<u64>,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 25,
            ack_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TimerSection {
    tick_ms: u64,
    grace_ms: u64,
    epsilon: f64,
    fresh_turn_jump_secs: f64,
    near_zero_secs: f64,
}

impl Default for TimerSection {
    fn default() -> Self {
        let engine = TimerConfig::default();
        Self {
            tick_ms: 100,
            grace_ms: engine.grace.as_millis() as u64,
            epsilon: engine.epsilon,
            fresh_turn_jump_secs: engine.fresh_turn_jump,
            near_zero_secs: engine.near_zero,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RulesSection {
    category_conflict: bool,
    pre_draft_countdown_secs: u64,
    local_auto_pick: bool,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            category_conflict: true,
            pre_draft_countdown_secs: 10,
            local_auto_pick: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TransportSection {
    probe_attempts: u32,
    probe_timeout_ms: u64,
    poll_interval_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            probe_attempts: 3,
            probe_timeout_ms: 3000,
            poll_interval_ms: 2000,
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub token: Option<String>,
    pub user_id: Option<String>,
}

/// The authenticated identity the session acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub token: String,
    pub user_id: String,
}

impl Config {
    /// The configured identity. Both `token` and `user_id` must be present.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        let token = self
            .credentials
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| invalid("credentials.token", "must be set in credentials.toml"))?;
        let user_id = self
            .credentials
            .user_id
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| invalid("credentials.user_id", "must be set in credentials.toml"))?;
        Ok(Identity { token, user_id })
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/client.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` does that first.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- client.toml (required) ---
    let client_path = config_dir.join("client.toml");
    let client_text = read_file(&client_path)?;
    let client: ClientFile = toml::from_str(&client_text).map_err(|e| ConfigError::ParseError {
        path: client_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = assemble(client, credentials);
    validate(&config)?;

    Ok(config)
}

fn assemble(client: ClientFile, credentials: CredentialsConfig) -> Config {
    let ClientFile {
        server,
        draft,
        reconnect,
        heartbeat,
        timer,
        rules,
        transport,
    } = client;

    let interval = Duration::from_secs(heartbeat.interval_secs);
    let ack_timeout = heartbeat
        .ack_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(interval * 2 + Duration::from_secs(5));

    Config {
        server,
        draft_id: draft.draft_id,
        reconnect: ReconnectConfig {
            base_delay: Duration::from_millis(reconnect.base_delay_ms),
            max_delay: Duration::from_millis(reconnect.max_delay_ms),
            fast_retry_delay: Duration::from_millis(reconnect.fast_retry_delay_ms),
            max_attempts: reconnect.max_attempts,
            fast_retry_codes: reconnect.fast_retry_codes,
            retry_on_going_away: reconnect.retry_on_going_away,
        },
        heartbeat: HeartbeatConfig {
            interval,
            ack_timeout,
        },
        timer: TimerSettings {
            tick: Duration::from_millis(timer.tick_ms),
            engine: TimerConfig {
                grace: Duration::from_millis(timer.grace_ms),
                epsilon: timer.epsilon,
                fresh_turn_jump: timer.fresh_turn_jump_secs,
                near_zero: timer.near_zero_secs,
            },
        },
        rules: RulesConfig {
            pick: PickRules {
                category_conflict: rules.category_conflict,
            },
            pre_draft_countdown: Duration::from_secs(rules.pre_draft_countdown_secs),
            local_auto_pick: rules.local_auto_pick,
        },
        transport: TransportConfig {
            probe_attempts: transport.probe_attempts,
            probe_timeout: Duration::from_millis(transport.probe_timeout_ms),
            poll_interval: Duration::from_millis(transport.poll_interval_ms),
        },
        credentials,
    }
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    create_dir(&config_dir)?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }

        let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        let target = config_dir.join(file_name);
        if write_new(&target, &content)? {
            copied.push(target);
        }
    }

    Ok(copied)
}

/// Loads config from the working directory when it holds `config/` or
/// `defaults/`, otherwise from the platform config directory (seeded with
/// the bundled `client.toml` on first use).
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    if cwd.join("config").exists() || cwd.join("defaults").exists() {
        ensure_config_files(&cwd)?;
        return load_config_from(&cwd);
    }

    let base_dir = platform_base_dir()?;
    seed_bundled_defaults(&base_dir)?;
    load_config_from(&base_dir)
}

fn platform_base_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("", "", "draftline")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| ConfigError::DefaultsCopyError {
            message: "no home directory to place configuration in".into(),
        })
}

/// Write the bundled `client.toml` under `base_dir/config/` unless present.
pub fn seed_bundled_defaults(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let config_dir = base_dir.join("config");
    create_dir(&config_dir)?;
    let target = config_dir.join("client.toml");
    if write_new(&target, DEFAULT_CLIENT_TOML.as_bytes())? {
        info!("Seeded {}", target.display());
        return Ok(Some(target));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn create_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create {}: {e}", dir.display()),
    })
}

/// Create `target` with `content`. Returns false if it already existed.
fn write_new(target: &Path, content: &[u8]) -> Result<bool, ConfigError> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(mut dest) => {
            std::io::Write::write_all(&mut dest, content).map_err(|e| {
                ConfigError::DefaultsCopyError {
                    message: format!("failed to write {}: {e}", target.display()),
                }
            })?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", target.display()),
        }),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let ws_url = &config.server.ws_url;
    if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
        return Err(invalid(
            "server.ws_url",
            format!("must start with ws:// or wss://, got {ws_url:?}"),
        ));
    }
    let api_url = &config.server.api_url;
    if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
        return Err(invalid(
            "server.api_url",
            format!("must start with http:// or https://, got {api_url:?}"),
        ));
    }

    if config.draft_id.trim().is_empty() {
        return Err(invalid("draft.draft_id", "must not be empty"));
    }

    // Reconnect
    let reconnect = &config.reconnect;
    if reconnect.base_delay.is_zero() {
        return Err(invalid("reconnect.base_delay_ms", "must be greater than 0"));
    }
    if reconnect.max_delay < reconnect.base_delay {
        return Err(invalid(
            "reconnect.max_delay_ms",
            "must be at least reconnect.base_delay_ms",
        ));
    }
    if reconnect.max_attempts == Some(0) {
        return Err(invalid("reconnect.max_attempts", "must be greater than 0 when set"));
    }

    // Heartbeat
    if config.heartbeat.interval.is_zero() {
        return Err(invalid("heartbeat.interval_secs", "must be greater than 0"));
    }
    if config.heartbeat.ack_timeout <= config.heartbeat.interval {
        return Err(invalid(
            "heartbeat.ack_timeout_secs",
            "must be longer than heartbeat.interval_secs",
        ));
    }

    // Timer
    if config.timer.tick.is_zero() {
        return Err(invalid("timer.tick_ms", "must be greater than 0"));
    }
    let epsilon = config.timer.engine.epsilon;
    if !(0.0..1.0).contains(&epsilon) {
        return Err(invalid(
            "timer.epsilon",
            format!("must be in [0.0, 1.0), got {epsilon}"),
        ));
    }
    if config.timer.engine.fresh_turn_jump <= 0.0 {
        return Err(invalid("timer.fresh_turn_jump_secs", "must be greater than 0"));
    }
    if config.timer.engine.near_zero < 0.0 {
        return Err(invalid("timer.near_zero_secs", "must not be negative"));
    }

    // Transport
    if config.transport.probe_attempts == 0 {
        return Err(invalid("transport.probe_attempts", "must be at least 1"));
    }
    if config.transport.probe_timeout.is_zero() {
        return Err(invalid("transport.probe_timeout_ms", "must be greater than 0"));
    }
    if config.transport.poll_interval.is_zero() {
        return Err(invalid("transport.poll_interval_ms", "must be greater than 0"));
    }

    Ok(())
}
