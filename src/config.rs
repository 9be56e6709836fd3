//! Configuration module for the emulator.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::endpoint::{EndpointError, ServiceEndpoint};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the emulator
#[derive(Parser, Debug, Default)]
#[command(name = "daq-emulator")]
#[command(version)]
#[command(about = "Serves a configuration file over the acquisition control gRPC API", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:50051)
    #[arg(short, long)]
    pub address: Option<String>,

    /// Configuration file returned by GetConfig
    #[arg(short = 'f', long)]
    pub path_to_file: Option<PathBuf>,

    /// Per-call timeout in seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Maximum concurrent calls per connection
    #[arg(long)]
    pub concurrency_limit: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub file: FileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_address")]
    pub address: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Per-call timeout in seconds
    pub request_timeout: Option<u64>,
    /// Maximum concurrent calls per connection
    pub concurrency_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            workers: None,
            backlog: default_backlog(),
            request_timeout: None,
            concurrency_limit: None,
        }
    }
}

/// Served file configuration
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    pub path: Option<PathBuf>,
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

fn default_address() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: ServiceEndpoint,
    pub path_to_file: PathBuf,
    pub backlog: i32,
    pub request_timeout: Option<Duration>,
    pub concurrency_limit: Option<usize>,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Configuration serving `path_to_file` on `endpoint`, everything else default.
    pub fn new(endpoint: ServiceEndpoint, path_to_file: impl Into<PathBuf>) -> Self {
        Config {
            endpoint,
            path_to_file: path_to_file.into(),
            backlog: default_backlog(),
            request_timeout: None,
            concurrency_limit: None,
            workers: None,
            log_level: default_log_level(),
        }
    }

    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
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

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let address = cli.address.unwrap_or(toml_config.server.address);
        let endpoint = ServiceEndpoint::parse(&address).map_err(ConfigError::InvalidAddress)?;

        let path_to_file = cli
            .path_to_file
            .or(toml_config.file.path)
            .ok_or(ConfigError::MissingFilePath)?;

        Ok(Config {
            endpoint,
            path_to_file,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            request_timeout: cli
                .request_timeout
                .or(toml_config.server.request_timeout)
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            concurrency_limit: cli
                .concurrency_limit
                .or(toml_config.server.concurrency_limit),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(EndpointError),
    MissingFilePath,
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
            ConfigError::InvalidAddress(e) => write!(f, "Invalid server address: {}", e),
            ConfigError::MissingFilePath => write!(
                f,
                "No configuration file to serve: pass --path-to-file or set [file] path"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
            ConfigError::InvalidAddress(e) => Some(e),
            ConfigError::MissingFilePath => None,
        }
    }
}
