//! Bot configuration
//!
//! Loaded from an optional TOML file, then overridden from the command line /
//! environment. Everything the store and transport need is handed to them at
//! construction time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Bot token is not configured (set KEYBOT_TOKEN or [bot].token)")]
    MissingToken,

    #[error("Storage connection string is not configured (set KEYBOT_DATABASE or [storage].connection_string)")]
    MissingConnectionString,

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Telegram transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Bot API token (secret)
    #[serde(default)]
    pub token: String,

    /// Bot API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Long-poll timeout passed to getUpdates, in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Pause before polling again after a transport error
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: default_api_url(),
            poll_timeout_secs: default_poll_timeout(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Issuance store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `Data Source=keys.db`, `sqlite://keys.db`, a plain path, or `:memory:`.
    /// No default: startup fails until one is configured.
    #[serde(default)]
    pub connection_string: String,

    /// Deadline for a single store operation
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,

    /// How long SQLite waits on a locked database before failing
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            op_timeout_ms: default_op_timeout(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StorageConfig {
    pub fn location(&self) -> Result<DatabaseLocation, ConfigError> {
        DatabaseLocation::parse(&self.connection_string)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

// Defaults
fn default_api_url() -> String { "https://api.telegram.org".to_string() }
fn default_poll_timeout() -> u64 { 30 }
fn default_retry_delay() -> u64 { 5000 }
fn default_op_timeout() -> u64 { 10_000 }
fn default_busy_timeout() -> u64 { 2_000 }

/// Where the issuance database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    /// Parse a storage connection string.
    ///
    /// Accepts ADO-style `Data Source=<path>` (other `key=value` pairs are
    /// ignored), `sqlite://<path>`, `sqlite:<path>`, `:memory:` and bare paths.
    pub fn parse(conn: &str) -> Result<Self, ConfigError> {
        let conn = conn.trim();
        if conn.is_empty() {
            return Err(ConfigError::MissingConnectionString);
        }

        let source = if conn.contains('=') {
            conn.split(';')
                .filter_map(|pair| pair.split_once('='))
                .find(|(k, _)| is_data_source_key(k.trim()))
                .map(|(_, v)| v.trim())
                .ok_or_else(|| {
                    ConfigError::InvalidConnectionString(format!("no Data Source in '{}'", conn))
                })?
        } else if let Some(rest) = conn.strip_prefix("sqlite://") {
            rest
        } else if let Some(rest) = conn.strip_prefix("sqlite:") {
            rest
        } else {
            conn
        };

        match source {
            "" => Err(ConfigError::InvalidConnectionString(format!("empty path in '{}'", conn))),
            ":memory:" => Ok(DatabaseLocation::Memory),
            path => Ok(DatabaseLocation::File(PathBuf::from(path))),
        }
    }
}

fn is_data_source_key(key: &str) -> bool {
    ["data source", "datasource", "filename"]
        .iter()
        .any(|k| key.eq_ignore_ascii_case(k))
}

impl Config {
    /// Load from a TOML file, or defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Token and connection string must both be present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        self.storage.location()?;
        Ok(())
    }
}
