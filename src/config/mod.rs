use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::path::PathBuf;
use std::path::Path;
use tracing::warn;

use crate::pool::{ConnArgs, PoolConfig};

/// Backend endpoint the pool connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Endpoint {
    /// TCP host and port
    Tcp { host: String, port: u16 },

    /// Unix domain socket path
    #[cfg(unix)]
    Unix { path: PathBuf },
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where to connect
    pub endpoint: Endpoint,

    /// Pool size bounds
    #[serde(default)]
    pub pool: PoolConfig,

    /// Extra arguments passed through to the connector
    #[serde(default, skip_serializing_if = "ConnArgs::is_empty")]
    pub conn_args: ConnArgs,
}

impl Config {
    /// Create a configuration for an endpoint with default pool settings
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            pool: PoolConfig::default(),
            conn_args: ConnArgs::new(),
        }
    }

    /// Check the pool bounds.
    ///
    /// A zero `max_size` can never hand out a connection and is rejected.
    /// `min_size` above `max_size` only limits warm-up, so it is just logged.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            anyhow::bail!("pool.max_size must be at least 1");
        }
        if self.pool.min_size > self.pool.max_size {
            warn!(
                min_size = self.pool.min_size,
                max_size = self.pool.max_size,
                "pool.min_size is larger than pool.max_size"
            );
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// - POOL_SOCKET (Unix socket path; selects the unix transport when set)
/// - POOL_HOST / POOL_PORT (TCP endpoint, used when POOL_SOCKET is unset)
/// - POOL_MIN_SIZE (optional, defaults to 1)
/// - POOL_MAX_SIZE (optional, defaults to 10)
/// - POOL_CONNECT_TIMEOUT_MS (optional)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let endpoint = endpoint_from_env()?;
    let mut config = Config::new(endpoint);

    if let Ok(min) = std::env::var("POOL_MIN_SIZE") {
        config.pool.min_size = min
            .parse()
            .context(format!("Invalid POOL_MIN_SIZE: {}", min))?;
    }

    if let Ok(max) = std::env::var("POOL_MAX_SIZE") {
        config.pool.max_size = max
            .parse()
            .context(format!("Invalid POOL_MAX_SIZE: {}", max))?;
    }

    if let Ok(timeout) = std::env::var("POOL_CONNECT_TIMEOUT_MS") {
        let ms: i64 = timeout
            .parse()
            .context(format!("Invalid POOL_CONNECT_TIMEOUT_MS: {}", timeout))?;
        config.conn_args.set("connect_timeout_ms", ms);
    }

    config.validate()?;
    Ok(config)
}

fn endpoint_from_env() -> Result<Endpoint> {
    #[cfg(unix)]
    if let Ok(path) = std::env::var("POOL_SOCKET") {
        return Ok(Endpoint::Unix {
            path: PathBuf::from(path),
        });
    }

    let host = std::env::var("POOL_HOST")
        .context("Neither POOL_SOCKET nor POOL_HOST environment variable is set")?;
    let port = std::env::var("POOL_PORT").context("POOL_PORT environment variable not set")?;
    let port = port
        .parse()
        .context(format!("Invalid POOL_PORT: {}", port))?;

    Ok(Endpoint::Tcp { host, port })
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
