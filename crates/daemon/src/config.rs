//! Configuration management for the WebTerm daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/webterm/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionDefaults;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be at most 10000 (0 = unlimited), got {0}")]
    InvalidMaxSessions(usize),

    #[error("max_connections must be between 1 and 10000, got {0}")]
    InvalidMaxConnections(usize),

    #[error("bind_addr must be a socket address such as 0.0.0.0:3000, got {0}")]
    InvalidBindAddr(String),

    #[error("heartbeat_timeout_secs ({timeout}) must exceed heartbeat_interval_secs ({interval}), and the interval must be non-zero")]
    InvalidHeartbeat { interval: u64, timeout: u64 },

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("sweep_interval_secs must be greater than 0")]
    InvalidSweepInterval,

    #[error("token_ttl_secs must be greater than 0")]
    InvalidTokenTtl,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("invalid user entry {username:?}: {reason}")]
    InvalidUser { username: String, reason: String },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the WebTerm daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener and connection settings.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Token signing and user accounts.
    pub auth: AuthConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP and WebSocket listener binds to.
    pub bind_addr: String,

    /// Maximum number of simultaneously admitted WebSocket connections.
    pub max_connections: usize,

    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,

    /// Seconds without any inbound frame before a connection is dropped.
    pub heartbeat_timeout_secs: u64,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for new sessions. Falls back to `$SHELL`, then `/bin/sh`.
    pub default_shell: Option<String>,

    /// Working directory for new sessions. Falls back to the home directory.
    pub default_cwd: Option<PathBuf>,

    pub default_cols: u16,
    pub default_rows: u16,

    /// Maximum number of concurrent sessions (0 = unlimited).
    pub max_sessions: usize,

    /// Sessions without input for this long are closed by the idle sweep.
    pub idle_timeout_secs: u64,

    pub sweep_interval_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when a session is closed.
    pub kill_grace_secs: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for access tokens. A random one is generated per run when unset.
    pub secret: Option<String>,

    /// Access token lifetime in seconds.
    pub token_ttl_secs: u64,

    /// Accounts allowed to log in.
    pub users: Vec<UserConfig>,
}

/// A single user account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub username: String,

    /// Hex-encoded SHA-256 of the password, as printed by `hash-password`.
    pub password_sha256: String,

    #[serde(default = "default_role")]
    pub role: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            max_connections: 100,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: None,
            default_cwd: None,
            default_cols: 80,
            default_rows: 24,
            max_sessions: 100,
            idle_timeout_secs: 3600,
            sweep_interval_secs: 60,
            kill_grace_secs: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_secs: 3600,
            users: Vec::new(),
        }
    }
}

fn default_role() -> String {
    "user".to_string()
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webterm")
        .join("config.toml")
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl SessionConfig {
    /// Registry defaults derived from this section.
    pub fn defaults(&self) -> SessionDefaults {
        SessionDefaults {
            shell: self.default_shell.clone(),
            cwd: self.default_cwd.clone(),
            cols: self.default_cols,
            rows: self.default_rows,
            max_sessions: self.max_sessions,
            kill_grace: Duration::from_secs(self.kill_grace_secs),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - WEBTERM_BIND_ADDR: Override listener address
    /// - WEBTERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WEBTERM_MAX_CONNECTIONS: Override the connection ceiling
    /// - WEBTERM_AUTH_SECRET: Override the token signing secret
    pub fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_value("WEBTERM_BIND_ADDR") {
            tracing::info!("Overriding bind_addr from environment: {}", addr);
            self.server.bind_addr = addr;
        }

        if let Some(level) = env_value("WEBTERM_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(raw) = env_value("WEBTERM_MAX_CONNECTIONS") {
            match raw.parse::<usize>() {
                Ok(max) => {
                    tracing::info!("Overriding max_connections from environment: {}", max);
                    self.server.max_connections = max;
                }
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring invalid WEBTERM_MAX_CONNECTIONS");
                }
            }
        }

        if let Some(secret) = env_value("WEBTERM_AUTH_SECRET") {
            tracing::info!("Overriding auth secret from environment");
            self.auth.secret = Some(secret);
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions > 10_000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.server.max_connections < 1 || self.server.max_connections > 10_000 {
            return Err(ConfigError::InvalidMaxConnections(
                self.server.max_connections,
            ));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }

        let interval = self.server.heartbeat_interval_secs;
        let timeout = self.server.heartbeat_timeout_secs;
        if interval == 0 || timeout <= interval {
            return Err(ConfigError::InvalidHeartbeat { interval, timeout });
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        if self.auth.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidTokenTtl);
        }

        if let Some(shell) = self.session.default_shell.as_deref() {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.to_string()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        for user in &self.auth.users {
            validate_user(user)?;
        }

        Ok(())
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

    /// Save configuration to the default path.
    pub fn save_default(&self) -> Result<()> {
        self.save(default_config_path())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn validate_user(user: &UserConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUser {
        username: user.username.clone(),
        reason: reason.to_string(),
    };

    if user.username.trim().is_empty() {
        return Err(invalid("username must not be empty"));
    }
    let digest = user.password_sha256.trim();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("password_sha256 must be 64 hex characters"));
    }
    Ok(())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
