//! Server configuration loading from file and environment variables.

use braid_vm::VmConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Admission engine settings.
    #[serde(default)]
    pub vm: VmConfig,
}

/// Network and identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// File holding the base64 Ed25519 seed this server signs with. Created
    /// with a fresh key on first start.
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: String,

    /// Capacity of the outbound federation queue.
    #[serde(default = "default_federation_queue")]
    pub federation_queue: usize,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "braid_vm=debug,info").
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
    8008
}

fn default_signing_key_path() -> String {
    "braid.signing.key".to_string()
}

fn default_federation_queue() -> usize {
    1024
}

fn default_db_path() -> String {
    "braid.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            signing_key_path: default_signing_key_path(),
            federation_queue: default_federation_queue(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
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
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `BRAID_HOST` overrides `server.host`
/// - `BRAID_PORT` overrides `server.port`
/// - `BRAID_SERVER_NAME` overrides `vm.server_name`
/// - `BRAID_SIGNING_KEY_PATH` overrides `server.signing_key_path`
/// - `BRAID_DB_PATH` overrides `database.path`
/// - `BRAID_LOG_LEVEL` overrides `logging.level`
/// - `BRAID_LOG_JSON` overrides `logging.json` (set to "true" to enable)
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

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `BRAID_*` overrides read through `var`. Unparseable values are
/// ignored.
pub fn apply_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("BRAID_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("BRAID_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(name) = var("BRAID_SERVER_NAME") {
        config.vm.server_name = name;
    }
    if let Some(path) = var("BRAID_SIGNING_KEY_PATH") {
        config.server.signing_key_path = path;
    }
    if let Some(db_path) = var("BRAID_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("BRAID_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("BRAID_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
