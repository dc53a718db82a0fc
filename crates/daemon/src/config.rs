//! Configuration management for the Termhub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("reap_interval_secs must be greater than 0")]
    InvalidReapInterval,

    #[error("spawn_timeout_secs must be greater than 0")]
    InvalidSpawnTimeout,

    #[error("default geometry must be non-zero, got {rows}x{cols}")]
    InvalidDefaultGeometry { rows: u16, cols: u16 },

    #[error("output_buffer_chunks must be between 1 and 65536, got {0}")]
    InvalidOutputBuffer(usize),

    #[error("bind_addr is not a socket address: {0}")]
    InvalidBindAddr(String),

    #[error("max_message_size must be greater than 0")]
    InvalidMaxMessageSize,

    #[error("assist endpoint_url must start with http:// or https://, got {0}")]
    InvalidAssistUrl(String),

    #[error("assist timeout_secs must be between 1 and 300, got {0}")]
    InvalidAssistTimeout(u64),

    #[error("client base_delay_ms ({base}) must not exceed max_delay_ms ({max})")]
    InvalidReconnectDelays { base: u64, max: u64 },

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default system prompt for the assistance gateway.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a terminal assistant that helps users with \
command-line tasks. Provide concise explanations and suggestions for terminal commands. \
Focus on being helpful, accurate, and security-conscious.";

/// Main configuration structure for the Termhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Streaming server configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Per-connection streaming policy.
    pub stream: StreamConfig,

    /// Assistance gateway configuration.
    pub assist: AssistConfig,

    /// Reconnecting client policy.
    pub client: ClientConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (pid file).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log to a daily-rotated file instead of stderr.
    pub log_file: Option<PathBuf>,
}

/// Streaming server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket server listens on.
    pub bind_addr: String,

    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,

    /// Seconds between server pings on each connection.
    pub ping_interval_secs: u64,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Seconds without input before a session is reaped.
    pub idle_timeout_secs: u64,

    /// Seconds between reaper passes.
    pub reap_interval_secs: u64,

    /// Seconds a closed id reports "gone" rather than "not found".
    pub close_grace_secs: u64,

    /// Seconds allowed for PTY startup.
    pub spawn_timeout_secs: u64,

    /// Milliseconds between SIGHUP and SIGKILL when closing.
    pub terminate_grace_ms: u64,

    /// Initial terminal rows.
    pub default_rows: u16,

    /// Initial terminal columns.
    pub default_cols: u16,

    /// Bytes of output replayed to newly attached connections.
    pub scrollback_bytes: usize,

    /// Bytes of output retained for poll-style reads.
    pub poll_buffer_bytes: usize,
}

/// Per-connection streaming policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Output chunks buffered per connection before new chunks are dropped.
    pub output_buffer_chunks: usize,
}

/// Assistance gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssistConfig {
    /// Forward assist requests to the gateway.
    pub enabled: bool,

    /// Base URL of the gateway.
    pub endpoint_url: String,

    /// Model provider name passed to the gateway.
    pub provider: String,

    /// Model name passed to the gateway.
    pub model: String,

    /// Seconds before an assist request times out.
    pub timeout_secs: u64,

    /// Sampling temperature.
    pub temperature: f32,

    /// Response length cap.
    pub max_tokens: u32,

    /// System prompt prepended to every conversation.
    pub system_prompt: String,

    /// Conversation turns kept per session.
    pub context_messages: usize,
}

/// Reconnecting client policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Delay before the first retry.
    pub base_delay_ms: u64,

    /// Cap on the retry delay.
    pub max_delay_ms: u64,

    /// Retries before giving up.
    pub max_attempts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8767".to_string(),
            max_message_size: 1024 * 1024, // 1MB
            ping_interval_secs: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 64,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 30,
            close_grace_secs: 60,
            spawn_timeout_secs: 10,
            terminate_grace_ms: 500,
            default_rows: 24,
            default_cols: 80,
            scrollback_bytes: 50_000,
            poll_buffer_bytes: 64 * 1024,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            output_buffer_chunks: 256,
        }
    }
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_url: "http://localhost:8003".to_string(),
            provider: "anthropic".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            timeout_secs: 30,
            temperature: 0.7,
            max_tokens: 500,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            context_messages: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhub")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHUB_BIND_ADDR: Override the streaming server address
    /// - TERMHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMHUB_ASSIST_URL: Override the assistance gateway URL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TERMHUB_BIND_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_addr from environment: {}", addr);
                self.server.bind_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(url) = std::env::var("TERMHUB_ASSIST_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding assist endpoint_url from environment: {}", url);
                self.assist.endpoint_url = url;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }
        if session.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }
        if session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval);
        }
        if session.spawn_timeout_secs == 0 {
            return Err(ConfigError::InvalidSpawnTimeout);
        }
        if session.default_rows == 0 || session.default_cols == 0 {
            return Err(ConfigError::InvalidDefaultGeometry {
                rows: session.default_rows,
                cols: session.default_cols,
            });
        }

        let chunks = self.stream.output_buffer_chunks;
        if chunks == 0 || chunks > 65536 {
            return Err(ConfigError::InvalidOutputBuffer(chunks));
        }

        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.server.bind_addr.clone()));
        }
        if self.server.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }

        let url = &self.assist.endpoint_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::InvalidAssistUrl(url.clone()));
        }
        if self.assist.timeout_secs == 0 || self.assist.timeout_secs > 300 {
            return Err(ConfigError::InvalidAssistTimeout(self.assist.timeout_secs));
        }

        if self.client.base_delay_ms > self.client.max_delay_ms {
            return Err(ConfigError::InvalidReconnectDelays {
                base: self.client.base_delay_ms,
                max: self.client.max_delay_ms,
            });
        }

        // The shell may carry arguments; only the program must resolve.
        let program = session
            .default_shell
            .split_whitespace()
            .next()
            .unwrap_or_default();
        let shell_path = Path::new(program);
        let found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            !program.is_empty() && which::which(program).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
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

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// Path of the daemon's pid file.
    pub fn pid_file_path(&self) -> PathBuf {
        self.daemon.data_dir.join("daemon.pid")
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
