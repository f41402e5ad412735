//! Server configuration loading from file and environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::Deserialize;
use sonde_datastore::DatabaseConfig;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseSection,

    /// Observation retention settings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path prefix for every API route, e.g. `/api`.
    #[serde(default)]
    pub api_prefix: String,
}

/// Database configuration; mirrors [`DatabaseConfig`].
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Registration key of this database instance.
    #[serde(default = "default_database_num")]
    pub database_num: u32,

    #[serde(default)]
    pub read_only: bool,

    /// Page cache budget in bytes; 0 keeps the engine default.
    #[serde(default)]
    pub memory_cache_size: u64,

    /// Dirty-byte threshold that triggers an auto-commit.
    #[serde(default = "default_auto_commit_buffer")]
    pub auto_commit_buffer_size: u64,

    /// Seconds between periodic auto-commits.
    #[serde(default = "default_auto_commit_period")]
    pub auto_commit_period_secs: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

impl DatabaseSection {
    pub fn to_database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            storage_path: self.path.clone(),
            database_num: self.database_num,
            read_only: self.read_only,
            memory_cache_size: self.memory_cache_size,
            auto_commit_buffer_size: self.auto_commit_buffer_size,
            auto_commit_period: Duration::from_secs(self.auto_commit_period_secs.max(1)),
            pool_max_size: self.pool_max_size,
            ..DatabaseConfig::default()
        }
    }
}

/// Observation retention enforcement.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Maximum observation age in seconds; 0 disables purging.
    #[serde(default)]
    pub max_age_secs: u64,

    /// Seconds between retention checks.
    #[serde(default = "default_retention_interval")]
    pub check_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "sonde_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8181
}

fn default_db_path() -> String {
    "sonde-obs.db".to_string()
}

fn default_database_num() -> u32 {
    1
}

fn default_auto_commit_buffer() -> u64 {
    4 * 1024 * 1024
}

fn default_auto_commit_period() -> u64 {
    10
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_retention_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_prefix: String::new(),
        }
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            database_num: default_database_num(),
            read_only: false,
            memory_cache_size: 0,
            auto_commit_buffer_size: default_auto_commit_buffer(),
            auto_commit_period_secs: default_auto_commit_period(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 0,
            check_interval_secs: default_retention_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SONDE_HOST` overrides `server.host`
/// - `SONDE_PORT` overrides `server.port`
/// - `SONDE_DB_PATH` overrides `database.path`
/// - `SONDE_READ_ONLY` overrides `database.read_only` ("true" / "1")
/// - `SONDE_LOG_LEVEL` overrides `logging.level`
/// - `SONDE_LOG_JSON` overrides `logging.json` ("true" / "1")
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("SONDE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("SONDE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("SONDE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(ro) = std::env::var("SONDE_READ_ONLY") {
        config.database.read_only = ro == "true" || ro == "1";
    }
    if let Ok(level) = std::env::var("SONDE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("SONDE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
