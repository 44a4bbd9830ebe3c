//! Configuration module for the agent.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the agent
#[derive(Parser, Debug, Default)]
#[command(name = "linewire-agent")]
#[command(version = "0.1.0")]
#[command(about = "A persistent remote-command agent", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Control endpoint host
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Control endpoint port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Seconds between HEARTBEAT frames
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Bytes requested per socket read
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Seconds a download or execute handler may run
    #[arg(long)]
    pub handler_timeout: Option<u64>,

    /// Directory DOWNLOAD filenames are resolved against
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

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
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control endpoint configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds allowed for the TCP handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Session behaviour
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// SO_KEEPALIVE idle time in seconds, 0 disables it
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            read_buffer_size: default_read_buffer_size(),
            handler_timeout: default_handler_timeout(),
            download_dir: default_download_dir(),
            tcp_keepalive: default_tcp_keepalive(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_handler_timeout() -> u64 {
    15
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub read_buffer_size: usize,
    pub handler_timeout: Duration,
    pub download_dir: PathBuf,
    pub tcp_keepalive: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            connect_timeout: Duration::from_secs(toml_config.server.connect_timeout),
            heartbeat_interval: Duration::from_secs(
                cli.heartbeat_interval
                    .unwrap_or(toml_config.agent.heartbeat_interval),
            ),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.agent.read_buffer_size),
            handler_timeout: Duration::from_secs(
                cli.handler_timeout
                    .unwrap_or(toml_config.agent.handler_timeout),
            ),
            download_dir: cli.download_dir.unwrap_or(toml_config.agent.download_dir),
            tcp_keepalive: match toml_config.agent.tcp_keepalive {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// `host:port` of the control endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive"));
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid("handler_timeout must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be positive"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
