//! Configuration types and loading
//!
//! The host front end owns its own configuration surface; this module
//! defines the plain values the registry consumes, loaded from a JSON file
//! or string and validated at construction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::record::DEFAULT_CACHE_MILLIS;

/// Default control-plane port
pub const DEFAULT_SERVER_PORT: u16 = 8848;

/// Registry client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Control-plane endpoint addresses (`host` or `host:port`)
    pub servers: Vec<String>,

    /// Control-plane HTTP port
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Default TTL for placeholder records, in milliseconds
    #[serde(default = "default_cache_millis")]
    pub default_cache_millis: i64,

    /// Directory holding one persisted response body per cache key
    pub cache_dir: PathBuf,

    /// Local client identity used as the push-path affinity key;
    /// defaults to the detected local IP when empty
    #[serde(default)]
    pub client_key: String,

    /// Whether to run the UDP push listener
    #[serde(default = "default_true")]
    pub enable_push: bool,

    /// TTL for cached front-end answers, in milliseconds
    #[serde(default = "default_answer_ttl")]
    pub answer_ttl_millis: i64,

    /// Capacity bound for the answer cache
    #[serde(default = "default_answer_capacity")]
    pub answer_capacity: u64,
}

const fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

const fn default_cache_millis() -> i64 {
    DEFAULT_CACHE_MILLIS
}

const fn default_true() -> bool {
    true
}

const fn default_answer_ttl() -> i64 {
    1000
}

const fn default_answer_capacity() -> u64 {
    10_000
}

impl RegistryConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "At least one registry server must be configured".into(),
            ));
        }

        if self.default_cache_millis <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "default_cache_millis must be positive, got {}",
                self.default_cache_millis
            )));
        }

        if self.answer_ttl_millis <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "answer_ttl_millis must be positive, got {}",
                self.answer_ttl_millis
            )));
        }

        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "cache_dir must not be empty".into(),
            ));
        }

        Ok(())
    }
}

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed, or if
/// validation fails.
pub fn load_config(path: impl AsRef<Path>) -> Result<RegistryConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;

    info!(
        "Configuration loaded: {} servers, cache dir {:?}, push {}",
        config.servers.len(),
        config.cache_dir,
        if config.enable_push { "enabled" } else { "disabled" }
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<RegistryConfig, ConfigError> {
    let config: RegistryConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}
