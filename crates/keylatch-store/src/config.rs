//! Connection configuration for store backends
//!
//! Settings can come from a serialized config file (JSON, TOML, ...) through
//! serde, or from `KEYLATCH_REDIS_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Conflicting configuration: {0}")]
    Conflict(String),
}

/// Redis / KeyDB connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name the connection is registered under (empty = default connection)
    pub alias: String,
    /// Host name or address (a `redis://` / `rediss://` prefix and `:port` suffix are accepted)
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database index
    pub db: u8,
    /// Use TLS (rustls)
    pub tls: bool,
    /// Number of pooled connections
    pub pool_size: usize,
    /// Connection timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            tls: false,
            pool_size: 4,
            connect_timeout_secs: None,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables
    ///
    /// `KEYLATCH_REDIS_URL` (host[:port], optional scheme) takes precedence over
    /// `KEYLATCH_REDIS_HOST` / `KEYLATCH_REDIS_PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            alias: env::var("KEYLATCH_REDIS_ALIAS").unwrap_or_default(),
            username: env::var("KEYLATCH_REDIS_USERNAME").ok(),
            password: env::var("KEYLATCH_REDIS_PASSWORD").ok(),
            tls: env::var("KEYLATCH_REDIS_TLS")
                .map(|v| v == "1" || v == "true")
                .unwrap_or(false),
            ..Self::default()
        };

        if let Ok(url) = env::var("KEYLATCH_REDIS_URL") {
            if url.starts_with("rediss://") {
                config.tls = true;
            }
            let (host, port) = parse_host_port(&url)?;
            config.host = host.to_string();
            config.port = port;
        } else {
            if let Ok(host) = env::var("KEYLATCH_REDIS_HOST") {
                config.host = host;
            }
            if let Ok(port) = env::var("KEYLATCH_REDIS_PORT") {
                config.port = parse_number("KEYLATCH_REDIS_PORT", &port)?;
            }
        }
        if let Ok(db) = env::var("KEYLATCH_REDIS_DB") {
            config.db = parse_number("KEYLATCH_REDIS_DB", &db)?;
        }
        if let Ok(size) = env::var("KEYLATCH_REDIS_POOL_SIZE") {
            config.pool_size = parse_number("KEYLATCH_REDIS_POOL_SIZE", &size)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no backend can use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".to_string()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Host and port after stripping any scheme from `host`. A port embedded
    /// in `host` wins over the `port` field.
    pub fn host_port(&self) -> Result<(&str, u16), ConfigError> {
        let bare = self
            .host
            .trim_start_matches("rediss://")
            .trim_start_matches("redis://");
        let bare = bare.split('/').next().unwrap_or(bare);
        if bare.contains(':') {
            parse_host_port(bare)
        } else {
            Ok((bare, self.port))
        }
    }

    /// Identity of the server-side database: two configs with the same key
    /// would share one keyspace.
    pub fn endpoint_key(&self) -> Result<String, ConfigError> {
        let (host, port) = self.host_port()?;
        Ok(format!("{host}+{port}+{}", self.db))
    }
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16), ConfigError> {
    let endpoint = endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    // Strip any trailing path segments (e.g. a `/0` database suffix).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid port in endpoint: {endpoint}")))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{name} is not a valid number: {raw}")))
}
