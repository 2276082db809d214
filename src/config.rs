//! Configuration for the sandbox interface.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the interface server
#[derive(Parser, Debug)]
#[command(name = "sandbox-interface")]
#[command(version = "0.1.0")]
#[command(about = "Binary command endpoint for the sandbox service", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:3333)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Close connections idle for longer than this many seconds
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on a single readiness wait, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3333".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_poll_interval_ms() -> u64 {
    1
}

fn default_idle_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub poll_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            poll_interval_ms: toml_config.server.poll_interval_ms,
            idle_timeout_secs: cli
                .idle_timeout
                .unwrap_or(toml_config.server.idle_timeout_secs),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Resolve into the settings the event loop runs with.
    pub fn interface_config(&self) -> Result<InterfaceConfig, ConfigError> {
        let listen = self
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("poll_interval_ms must be positive"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be positive"));
        }

        Ok(InterfaceConfig {
            listen,
            backlog: self.backlog,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        })
    }
}

/// Settings consumed by [`Interface::start`](crate::runtime::Interface::start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub listen: SocketAddr,
    pub backlog: i32,
    /// Bound on one readiness wait; also the granularity of idle checks.
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3333)),
            backlog: default_backlog(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            idle_timeout: Duration::from_secs(default_idle_timeout_secs()),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("Invalid configuration: {0}")]
    InvalidValue(&'static str),
}
