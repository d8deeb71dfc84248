//! Configuration management for sshmux.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sshmux/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::{ConnectorSettings, TrustMode};
use crate::mux::{parse_escape_key, MuxOptions};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("escape_key must be in ^X notation (^@ through ^_), got {0:?}")]
    InvalidEscapeKey(String),

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u32),

    #[error("connect_timeout_secs must be between 1 and 300, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("terminal size must be at least 1x1 and at most 1000x1000, got {0}x{1}")]
    InvalidTerminalSize(u16, u16),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Private keys tried, in order, when no identity file is configured.
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Front-end behaviour.
    pub mux: MuxConfig,

    /// SSH connection settings shared by every session.
    pub connection: ConnectionConfig,

    /// Remote PTY defaults.
    pub terminal: TerminalConfig,

    /// Log output.
    pub logging: LoggingConfig,
}

/// Front-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MuxConfig {
    /// Escape prefix in `^X` notation.
    pub escape_key: String,

    /// User for hosts given without `user@`. Empty means `$USER`.
    pub default_user: String,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Port for hosts given without `:port`.
    pub port: u32,

    /// Private key offered to every host.
    pub identity_file: Option<PathBuf>,

    /// Trusted host keys.
    pub known_hosts: PathBuf,

    /// Accept any host key.
    pub insecure: bool,

    /// Bound on dialing and on shell negotiation.
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval (0 = disabled).
    pub keepalive_secs: u64,
}

/// Remote PTY defaults, used when the local terminal cannot be queried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    pub default_term: String,
    pub default_cols: u16,
    pub default_rows: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for `sshmux.log`.
    pub log_dir: PathBuf,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            escape_key: "^A".to_string(),
            default_user: String::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: 22,
            identity_file: None,
            known_hosts: ssh_dir().join("known_hosts"),
            insecure: false,
            connect_timeout_secs: 10,
            keepalive_secs: 30,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: default_log_dir(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshmux")
        .join("config.toml")
}

/// Returns the default log directory.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshmux")
}

fn ssh_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh")
}

/// Expands a leading `~/` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Returns the login name of the current user.
fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "root".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SSHMUX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SSHMUX_IDENTITY_FILE: Override the private key path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SSHMUX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }

        if let Ok(path) = std::env::var("SSHMUX_IDENTITY_FILE") {
            if !path.is_empty() {
                tracing::info!("Overriding identity_file from environment: {}", path);
                self.connection.identity_file = Some(PathBuf::from(path));
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_escape_key(&self.mux.escape_key).is_none() {
            return Err(ConfigError::InvalidEscapeKey(self.mux.escape_key.clone()));
        }

        if self.connection.port == 0 || self.connection.port > u32::from(u16::MAX) {
            return Err(ConfigError::InvalidPort(self.connection.port));
        }

        if self.connection.connect_timeout_secs == 0 || self.connection.connect_timeout_secs > 300 {
            return Err(ConfigError::InvalidConnectTimeout(
                self.connection.connect_timeout_secs,
            ));
        }

        let (cols, rows) = (self.terminal.default_cols, self.terminal.default_rows);
        if cols == 0 || rows == 0 || cols > 1000 || rows > 1000 {
            return Err(ConfigError::InvalidTerminalSize(cols, rows));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// The escape prefix byte. Falls back to `^A` if the configured key is
    /// invalid; call [`validate`](Self::validate) first.
    pub fn escape_byte(&self) -> u8 {
        parse_escape_key(&self.mux.escape_key).unwrap_or(crate::mux::ESCAPE_BYTE)
    }

    /// The user for hosts without `user@`.
    pub fn default_user(&self) -> String {
        if self.mux.default_user.is_empty() {
            current_user()
        } else {
            self.mux.default_user.clone()
        }
    }

    /// The private key to offer: the configured one, else the first
    /// standard key found in `~/.ssh`.
    pub fn identity_file(&self) -> Option<PathBuf> {
        match &self.connection.identity_file {
            Some(path) => Some(expand_tilde(path)),
            None => {
                let dir = ssh_dir();
                DEFAULT_IDENTITIES
                    .iter()
                    .map(|name| dir.join(name))
                    .find(|path| path.is_file())
            }
        }
    }

    /// The SSH keepalive interval, if enabled.
    pub fn keepalive(&self) -> Option<Duration> {
        match self.connection.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Settings for the session connector.
    pub fn connector_settings(&self) -> ConnectorSettings {
        let trust = if self.connection.insecure {
            TrustMode::Insecure
        } else {
            TrustMode::KnownHosts(expand_tilde(&self.connection.known_hosts))
        };

        ConnectorSettings {
            key_path: self.identity_file(),
            trust,
            default_port: u16::try_from(self.connection.port).unwrap_or(22),
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            default_term: self.terminal.default_term.clone(),
            default_size: (self.terminal.default_cols, self.terminal.default_rows),
        }
    }

    /// Options for the multiplexer front-end.
    pub fn mux_options(&self) -> MuxOptions {
        MuxOptions {
            escape: self.escape_byte(),
            default_user: self.default_user(),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
