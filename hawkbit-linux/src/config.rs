//! Load config from a TOML file, then apply environment overrides and validate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use hawkbit_core::SchedulerConfig;
use serde::Deserialize;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hawkbit-updater/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no such configuration file: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Log verbosity, named after the levels operators already use in their config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Critical,
    Warning,
    Message,
    Info,
    Debug,
}

impl LogLevel {
    /// `tracing` filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::Warning => "warn",
            LogLevel::Message | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "warning" => Ok(LogLevel::Warning),
            "message" => Ok(LogLevel::Message),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(ConfigError::Invalid(format!("unknown log_level '{}'", other))),
        }
    }
}

/// Agent configuration. Env overrides: HAWKBIT_SERVER, HAWKBIT_AUTH_TOKEN, HAWKBIT_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub client: ClientConfig,
    /// Device attributes sent on identification.
    #[serde(default)]
    pub device: BTreeMap<String, String>,
    /// Attribute name to file; each file is read at identification time.
    #[serde(default)]
    pub attribute_files: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Host (`name:port`) or base URL of the update server.
    pub hawkbit_server: String,
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Controller id. Ignored when `device_id_file` is set.
    #[serde(default)]
    pub target_name: Option<String>,
    /// File holding the controller id (alphanumeric).
    #[serde(default)]
    pub device_id_file: Option<PathBuf>,
    pub auth_token: String,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    /// Seconds; 0 means default (20).
    #[serde(default)]
    pub connect_timeout: u64,
    /// Seconds without data before a request is abandoned; 0 means default (60).
    #[serde(default)]
    pub timeout: u64,
    /// Seconds to wait after a retryable failure; 0 means default (300).
    #[serde(default)]
    pub retry_wait: u64,
    /// Where the bundle is written before installation.
    pub bundle_download_location: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Reboot after a successful install when this file exists.
    #[serde(default = "default_reboot_marker")]
    pub reboot_marker: PathBuf,
    /// Installer executable, invoked as `<installer> install <bundle>`.
    #[serde(default = "default_installer")]
    pub installer: String,
    /// Consecutive auth failures before the agent exits; 0 retries forever.
    #[serde(default)]
    pub auth_failure_limit: u32,
}

const DEFAULT_CONNECT_TIMEOUT: u64 = 20;
const DEFAULT_TIMEOUT: u64 = 60;
const DEFAULT_RETRY_WAIT: u64 = 300;

fn default_tenant_id() -> String {
    "DEFAULT".to_string()
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> LogLevel {
    LogLevel::Message
}
fn default_reboot_marker() -> PathBuf {
    PathBuf::from("/tmp/.do_reboot")
}
fn default_installer() -> String {
    "rauc".to_string()
}

impl Config {
    /// Load: file, then env vars, then validation.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut c = Config::parse(&s)?;
        c.apply_env(|key| std::env::var(key).ok())?;
        c.validate()?;
        Ok(c)
    }

    /// Parse TOML and fill zero timeouts with defaults. Does not validate.
    pub fn parse(s: &str) -> Result<Config, ConfigError> {
        let mut c: Config = toml::from_str(s)?;
        let client = &mut c.client;
        if client.connect_timeout == 0 {
            client.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        if client.timeout == 0 {
            client.timeout = DEFAULT_TIMEOUT;
        }
        if client.retry_wait == 0 {
            client.retry_wait = DEFAULT_RETRY_WAIT;
        }
        Ok(c)
    }

    fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("HAWKBIT_SERVER") {
            self.client.hawkbit_server = s;
        }
        if let Some(s) = var("HAWKBIT_AUTH_TOKEN") {
            self.client.auth_token = s;
        }
        if let Some(s) = var("HAWKBIT_LOG_LEVEL") {
            self.client.log_level = s.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.client;
        if c.timeout > 0 && c.connect_timeout > 0 && c.timeout < c.connect_timeout {
            return Err(ConfigError::Invalid(format!(
                "timeout should be greater than connect_timeout. Timeout: {}, Connect timeout: {}",
                c.timeout, c.connect_timeout
            )));
        }
        if c.hawkbit_server.trim().is_empty() {
            return Err(ConfigError::Invalid("hawkbit_server is empty".into()));
        }
        if c.auth_token.trim().is_empty() {
            return Err(ConfigError::Invalid("auth_token is empty".into()));
        }
        if c.bundle_download_location.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "bundle_download_location is empty".into(),
            ));
        }
        let has_name = c
            .target_name
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty());
        if !has_name && c.device_id_file.is_none() {
            return Err(ConfigError::Invalid(
                "either target_name or device_id_file is required".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.client.connect_timeout)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client.timeout)
    }

    pub fn scheduler_config(&self, run_once: bool) -> SchedulerConfig {
        SchedulerConfig {
            retry_wait: Duration::from_secs(self.client.retry_wait),
            run_once,
            auth_failure_limit: self.client.auth_failure_limit,
            ..SchedulerConfig::default()
        }
    }
}
