//! Configuration for the packet-link echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use packet_link::{ConnectionOptions, Endpoint};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "packet-link")]
#[command(author = "packet-link authors")]
#[command(version = "0.1.0")]
#[command(about = "A packet-framed echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Endpoint to listen on (host:port, unix:/path or pipe:\\.\pipe\name)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Initial per-connection read buffer size in bytes
    #[arg(long)]
    pub read_buffer: Option<usize>,

    /// Read buffer growth ratio (0 = fixed size)
    #[arg(long)]
    pub threshold: Option<usize>,

    /// Seconds without traffic before a connection is stopped (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Endpoint to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    /// Small-send staging capacity (0 = disabled)
    #[serde(default = "default_lazy_buffer")]
    pub lazy_buffer: usize,
    #[serde(default = "default_post_slots")]
    pub post_slots: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer: default_read_buffer(),
            threshold: default_threshold(),
            lazy_buffer: default_lazy_buffer(),
            post_slots: default_post_slots(),
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
    "127.0.0.1:7100".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_read_buffer() -> usize {
    ConnectionOptions::default().read_buffer_size
}

fn default_threshold() -> usize {
    ConnectionOptions::default().threshold
}

fn default_lazy_buffer() -> usize {
    ConnectionOptions::default().lazy_buffer_size
}

fn default_post_slots() -> usize {
    ConnectionOptions::default().post_slots
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Endpoint,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub idle_timeout: u64,
    pub connection: ConnectionOptions,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse::<Endpoint>()
            .map_err(|e| ConfigError::Invalid(format!("listen: {e}")))?;

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if toml_config.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let read_buffer = cli.read_buffer.unwrap_or(toml_config.connection.read_buffer);
        if read_buffer == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer must be at least 1 byte".to_string(),
            ));
        }

        Ok(Config {
            listen,
            workers,
            max_connections: toml_config.server.max_connections,
            idle_timeout: cli.idle_timeout.unwrap_or(toml_config.server.idle_timeout),
            connection: ConnectionOptions {
                active: true,
                read_buffer_size: read_buffer,
                threshold: cli.threshold.unwrap_or(toml_config.connection.threshold),
                lazy_buffer_size: toml_config.connection.lazy_buffer,
                post_slots: toml_config.connection.post_slots,
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("packet-link").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7100");
        assert_eq!(config.server.idle_timeout, 300);
        assert_eq!(config.connection.read_buffer, 0x1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "unix:/tmp/packet-link.sock"
            workers = 4
            idle_timeout = 30

            [connection]
            read_buffer = 512
            threshold = 0
            lazy_buffer = 0

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.workers, Some(4));
        assert_eq!(toml_config.connection.post_slots, 4);

        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(
            config.listen,
            Endpoint::Unix(PathBuf::from("/tmp/packet-link.sock"))
        );
        assert_eq!(config.idle_timeout, 30);
        assert_eq!(config.connection.read_buffer_size, 512);
        assert_eq!(config.connection.threshold, 0);
        assert_eq!(config.connection.lazy_buffer_size, 0);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 2

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&[
                "--listen",
                "127.0.0.1:9100",
                "-w",
                "8",
                "--read-buffer",
                "64",
                "--log-level",
                "trace",
            ]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.listen, Endpoint::Tcp("127.0.0.1:9100".to_string()));
        assert_eq!(config.workers, Some(8));
        assert_eq!(config.connection.read_buffer_size, 64);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::merge(cli(&["--listen", "nowhere"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(cli(&["-w", "0"]), TomlConfig::default()).unwrap_err();
        assert!(err.to_string().contains("workers"));

        let err = Config::merge(cli(&["--read-buffer", "0"]), TomlConfig::default()).unwrap_err();
        assert!(err.to_string().contains("read_buffer"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_args(cli(&["--config", "/nonexistent/packet-link.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
