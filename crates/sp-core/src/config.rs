use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration loaded from `~/.shellpool/config.toml`.
///
/// **Security**: This struct NEVER stores passwords. The device section only
/// names the environment variables that hold the login and privileged
/// secrets; see [`crate::secret::Secret::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `~/.shellpool/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            info!(path = %path.display(), "no config file, using defaults");
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        debug!(
            path = %path.display(),
            host = %cfg.device.host,
            capacity = cfg.pool.capacity,
            "loaded config"
        );
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.session.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shellpool")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// SSH client launched inside the pseudo-terminal.
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    /// Extra arguments passed to the SSH client before the destination.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Env var holding the login (primary) secret.
    #[serde(default)]
    pub login_secret_env: Option<String>,
    /// Env var holding the privileged (administrator) secret.
    #[serde(default)]
    pub admin_secret_env: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            ssh_program: default_ssh_program(),
            extra_args: Vec::new(),
            login_secret_env: None,
            admin_secret_env: None,
        }
    }
}

impl DeviceConfig {
    /// `user@host`, or just `host` when no username is configured.
    pub fn destination(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

fn default_port() -> u16 {
    22
}
fn default_ssh_program() -> String {
    "ssh".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of concurrently open sessions.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// How often the idle reaper runs. Zero disables it.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            idle_timeout_ms: default_idle_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_ms > 0).then(|| Duration::from_millis(self.reap_interval_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Validation(
                "pool.capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_capacity() -> usize {
    2
}
fn default_idle_timeout_ms() -> u64 {
    5 * 60 * 1000
}
fn default_acquire_timeout_ms() -> u64 {
    30 * 1000
}
fn default_reap_interval_ms() -> u64 {
    60 * 1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Terminator appended to every line written to the device.
    #[serde(default = "default_line_ending")]
    pub line_ending: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    #[serde(default = "default_elevate_timeout_ms")]
    pub elevate_timeout_ms: u64,
    /// Command substring -> timeout in milliseconds, for commands known to
    /// take longer than `command_timeout_ms`.
    #[serde(default = "default_slow_commands")]
    pub slow_commands: BTreeMap<String, u64>,
    /// Commands sent once right after login. A rejection by the device is
    /// logged and ignored.
    #[serde(default)]
    pub init_commands: Vec<String>,
    #[serde(default = "default_elevate_command")]
    pub elevate_command: String,
    #[serde(default = "default_privileged_secret_command")]
    pub privileged_secret_command: String,
    #[serde(default = "default_primary_secret_command")]
    pub primary_secret_command: String,
    /// Trailing character of the prompt once privileges are granted.
    #[serde(default = "default_elevated_prompt_suffix")]
    pub elevated_prompt_suffix: String,
    /// Output fragments that mean an authentication step was rejected.
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
    #[serde(default)]
    pub ready_prompt_pattern: Option<String>,
    #[serde(default)]
    pub secret_prompt_pattern: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_ending: default_line_ending(),
            command_timeout_ms: default_command_timeout_ms(),
            login_timeout_ms: default_login_timeout_ms(),
            elevate_timeout_ms: default_elevate_timeout_ms(),
            slow_commands: default_slow_commands(),
            init_commands: Vec::new(),
            elevate_command: default_elevate_command(),
            privileged_secret_command: default_privileged_secret_command(),
            primary_secret_command: default_primary_secret_command(),
            elevated_prompt_suffix: default_elevated_prompt_suffix(),
            failure_markers: default_failure_markers(),
            ready_prompt_pattern: None,
            secret_prompt_pattern: None,
        }
    }
}

impl SessionConfig {
    /// Deadline budget for a single command, honouring `slow_commands`.
    pub fn timeout_for(&self, command: &str) -> Duration {
        let ms = self
            .slow_commands
            .iter()
            .filter(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, ms)| *ms)
            .max()
            .unwrap_or(self.command_timeout_ms)
            .max(self.command_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn elevate_timeout(&self) -> Duration {
        Duration::from_millis(self.elevate_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.line_ending.is_empty() {
            return Err(ConfigError::Validation(
                "session.line_ending must not be empty".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "session.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.elevate_command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "session.elevate_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_line_ending() -> String {
    "\r".into()
}
fn default_command_timeout_ms() -> u64 {
    15_000
}
fn default_login_timeout_ms() -> u64 {
    10_000
}
fn default_elevate_timeout_ms() -> u64 {
    10_000
}
fn default_slow_commands() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("show status dhcp".to_string(), 30_000),
        ("show environment".to_string(), 20_000),
    ])
}
fn default_elevate_command() -> String {
    "administrator".into()
}
fn default_privileged_secret_command() -> String {
    "administrator password".into()
}
fn default_primary_secret_command() -> String {
    "login password".into()
}
fn default_elevated_prompt_suffix() -> String {
    "#".into()
}
fn default_failure_markers() -> Vec<String> {
    vec!["incorrect".into(), "failed".into(), "Invalid".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
