//! Configuration module for the raw echo reactor.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::ReactorConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// Command-line arguments for the echo reactor
#[derive(Parser, Debug)]
#[command(name = "raw-echo")]
#[command(version = "0.1.0")]
#[command(about = "Raw TCP echo reactor that exits once idle", long_about = None)]
pub struct CliArgs {
    /// Host to listen on (empty or omitted listens on all interfaces)
    pub host: Option<String>,

    /// Port number or service name (e.g. amqp)
    pub port: Option<String>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Idle window in milliseconds before the listener is closed
    #[arg(long = "idle-timeout")]
    pub idle_timeout_ms: Option<u64>,

    /// Interval in milliseconds between keep-alive wakes
    #[arg(long = "keepalive")]
    pub keepalive_interval_ms: Option<u64>,

    /// Size of each read buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub connections: ConnectionsConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub host: String,
    /// Port number or service name
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Connection and buffer limits
#[derive(Debug, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Read buffers given to each new connection
    #[serde(default = "default_read_buffers")]
    pub read_buffers: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_buffers_per_connection")]
    pub max_buffers_per_connection: usize,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            read_buffers: default_read_buffers(),
            buffer_size: default_buffer_size(),
            max_buffers_per_connection: default_max_buffers_per_connection(),
        }
    }
}

/// Timer cadence
#[derive(Debug, Deserialize)]
pub struct TimersConfig {
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            keepalive_interval_ms: default_keepalive_interval(),
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

fn default_port() -> String {
    "amqp".to_string()
}

fn default_backlog() -> i32 {
    16
}

fn default_max_connections() -> usize {
    5
}

fn default_read_buffers() -> usize {
    4
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_buffers_per_connection() -> usize {
    16
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_idle_timeout() -> u64 {
    20000
}

fn default_keepalive_interval() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Well-known service names accepted in place of a port number.
const SERVICES: &[(&str, u16)] = &[("amqp", 5672), ("amqps", 5671)];

/// Resolve a port number or service name.
pub fn resolve_port(service: &str) -> Result<u16, ConfigError> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }
    SERVICES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(service))
        .map(|&(_, port)| port)
        .ok_or_else(|| ConfigError::UnknownService(service.to_string()))
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: String,
    pub backlog: i32,
    pub max_connections: usize,
    pub read_buffers: usize,
    pub buffer_size: usize,
    pub max_buffers_per_connection: usize,
    pub busy_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.listener.host),
            port: cli.port.unwrap_or(toml_config.listener.port),
            backlog: toml_config.listener.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.connections.max_connections),
            read_buffers: toml_config.connections.read_buffers,
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connections.buffer_size),
            max_buffers_per_connection: toml_config.connections.max_buffers_per_connection,
            busy_timeout_ms: toml_config.timers.busy_timeout_ms,
            idle_timeout_ms: cli
                .idle_timeout_ms
                .unwrap_or(toml_config.timers.idle_timeout_ms),
            keepalive_interval_ms: cli
                .keepalive_interval_ms
                .unwrap_or(toml_config.timers.keepalive_interval_ms),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        if self.read_buffers == 0 {
            return Err(ConfigError::Invalid("read_buffers must be positive"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive"));
        }
        if self.max_buffers_per_connection < self.read_buffers {
            return Err(ConfigError::Invalid(
                "max_buffers_per_connection must be at least read_buffers",
            ));
        }
        resolve_port(&self.port)?;
        Ok(())
    }

    /// Resolve host and port/service to the address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let port = resolve_port(&self.port)?;
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        (host, port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(host.to_string(), e))?
            .next()
            .ok_or_else(|| ConfigError::NoAddress(host.to_string()))
    }

    /// Tunables for the reactor.
    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            max_connections: self.max_connections,
            read_buffers: self.read_buffers,
            buffer_size: self.buffer_size,
            max_buffers_per_connection: self.max_buffers_per_connection,
            busy_timeout_ms: self.busy_timeout_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            keepalive_interval_ms: self.keepalive_interval_ms,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    UnknownService(String),
    Resolve(String, std::io::Error),
    NoAddress(String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::UnknownService(name) => write!(f, "Unknown service name '{name}'"),
            ConfigError::Resolve(host, e) => write!(f, "Failed to resolve '{host}': {e}"),
            ConfigError::NoAddress(host) => write!(f, "No address found for '{host}'"),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
