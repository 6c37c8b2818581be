//! Configuration for the framed TCP server.
//!
//! `ServerConfig` is what the library applies to each accepted socket. The
//! demo binary resolves a full `Config` from command-line arguments and an
//! optional TOML file; CLI arguments take precedence over file values.

use crate::codec::{CodecError, LenFieldWidth};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "framed-tcp")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed framed-message echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:10001 or :10001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Width of the length field in bytes (1, 2 or 4)
    #[arg(short = 'w', long)]
    pub len_field_width: Option<usize>,

    /// Largest accepted payload in bytes
    #[arg(short = 'm', long)]
    pub max_frame_len: Option<usize>,

    /// Per-frame read timeout in seconds (0 = disabled)
    #[arg(short = 't', long)]
    pub read_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Per-socket and per-session options applied by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Disable Nagle's algorithm on accepted sockets
    #[serde(default = "default_true")]
    pub no_delay: bool,
    /// Enable TCP keepalive on accepted sockets
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Keepalive probe period in seconds, only used with `keep_alive`
    #[serde(default = "default_keep_alive_period")]
    pub keep_alive_period_sec: u64,
    /// Live sessions allowed at once (0 = unlimited)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-frame read timeout in seconds (0 = disabled)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_sec: u64,
    /// Outbound queue capacity per session (0 = default of 1024)
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: true,
            keep_alive_period_sec: default_keep_alive_period(),
            max_connections: default_max_connections(),
            read_timeout_sec: default_read_timeout(),
            send_buffer_size: default_send_buffer_size(),
        }
    }
}

/// Length-field codec options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_len_field_width")]
    pub len_field_width: usize,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            len_field_width: default_len_field_width(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// `[server]` table: the listen address plus the socket options.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(flatten)]
    pub options: ServerConfig,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            options: ServerConfig::default(),
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

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_period() -> u64 {
    60
}

fn default_max_connections() -> usize {
    10000
}

fn default_read_timeout() -> u64 {
    10
}

fn default_send_buffer_size() -> usize {
    1024
}

fn default_len_field_width() -> usize {
    4
}

fn default_max_frame_len() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

fn default_listen() -> String {
    "0.0.0.0:10001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub server: ServerConfig,
    pub codec: CodecConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut server = toml_config.server.options;
        if let Some(read_timeout) = cli.read_timeout {
            server.read_timeout_sec = read_timeout;
        }

        let codec = CodecConfig {
            len_field_width: cli
                .len_field_width
                .unwrap_or(toml_config.codec.len_field_width),
            max_frame_len: cli
                .max_frame_len
                .unwrap_or(toml_config.codec.max_frame_len),
        };
        LenFieldWidth::try_from(codec.len_field_width)?;

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            server,
            codec,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid codec configuration: {0}")]
    InvalidCodec(#[from] CodecError),
}
