//! Configuration module for the backup server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the backup server
#[derive(Parser, Debug, Default)]
#[command(name = "backup-server")]
#[command(author = "backup-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A per-user file backup server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding one subdirectory per user id
    #[arg(short = 'd', long)]
    pub base_dir: Option<PathBuf>,

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
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-user directory tree
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Bytes moved per read/write when streaming payloads
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Write payloads to a staging file and rename into place
    #[serde(default = "default_atomic_store")]
    pub atomic_store: bool,
    /// Hold a per-path lock for the duration of store and delete
    #[serde(default)]
    pub serialize_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            chunk_size: default_chunk_size(),
            atomic_store: default_atomic_store(),
            serialize_writes: false,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("backupsvr")
}

fn default_chunk_size() -> usize {
    4096
}

fn default_atomic_store() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub base_dir: PathBuf,
    pub chunk_size: usize,
    pub atomic_store: bool,
    pub serialize_writes: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::merge(cli, toml_config);
        if config.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero"));
        }
        if config.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be greater than zero"));
        }
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers),
            base_dir: cli.base_dir.unwrap_or(toml_config.storage.base_dir),
            chunk_size: toml_config.storage.chunk_size,
            atomic_store: toml_config.storage.atomic_store,
            serialize_writes: toml_config.storage.serialize_writes,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// The `host:port` string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.storage.base_dir, PathBuf::from("backupsvr"));
        assert_eq!(config.storage.chunk_size, 4096);
        assert!(config.storage.atomic_store);
        assert!(!config.storage.serialize_writes);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 4000
            workers = 4

            [storage]
            base_dir = "/var/lib/backups"
            chunk_size = 65536
            atomic_store = false
            serialize_writes = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.storage.base_dir, PathBuf::from("/var/lib/backups"));
        assert_eq!(config.storage.chunk_size, 65536);
        assert!(!config.storage.atomic_store);
        assert!(config.storage.serialize_writes);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs {
            port: Some(9000),
            base_dir: Some(PathBuf::from("/tmp/other")),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        let file: TomlConfig = toml::from_str("[server]\nport = 4000\nhost = \"10.0.0.1\"").unwrap();

        let config = Config::merge(cli, file);
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.base_dir, PathBuf::from("/tmp/other"));
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.listen_addr(), "10.0.0.1:9000");
    }
}
