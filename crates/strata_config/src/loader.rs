//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::CacheConfig;
use std::path::Path;

/// Name of the configuration file within a configuration directory.
pub const CONFIG_FILE: &str = "strata.toml";

/// Highest deflate level accepted for containers.
const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Loads and validates a `strata.toml` configuration from a directory.
///
/// Reads `<dir>/strata.toml`, parses it, and validates required fields.
pub fn load_config(dir: &Path) -> Result<CacheConfig, ConfigError> {
    let config_path = dir.join(CONFIG_FILE);
    let content =
        std::fs::read_to_string(&config_path).map_err(|source| ConfigError::IoError {
            path: config_path.clone(),
            source,
        })?;
    load_config_from_str(&content)
}

/// Parses and validates a `strata.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<CacheConfig, ConfigError> {
    let config: CacheConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates that required fields are present and configuration values are consistent.
fn validate_config(config: &CacheConfig) -> Result<(), ConfigError> {
    if config.build_root.as_os_str().is_empty() {
        return Err(ConfigError::MissingField("build_root".to_string()));
    }
    if config.local_tier.as_os_str().is_empty() {
        return Err(ConfigError::MissingField("local_tier".to_string()));
    }
    if config.write_to_shared && config.shared_tier.is_none() {
        return Err(ConfigError::ValidationError(
            "write_to_shared requires shared_tier".to_string(),
        ));
    }
    if let Some(shared) = &config.shared_tier {
        if config.local_tier.starts_with(shared) || shared.starts_with(&config.local_tier) {
            return Err(ConfigError::OverlappingTiers {
                local: config.local_tier.clone(),
                shared: shared.clone(),
            });
        }
    }
    if config.archive.workers == Some(0) {
        return Err(ConfigError::ValidationError(
            "archive.workers must be positive".to_string(),
        ));
    }
    if config.archive.compression_level > MAX_COMPRESSION_LEVEL {
        return Err(ConfigError::ValidationError(format!(
            "archive.compression_level must be at most {MAX_COMPRESSION_LEVEL}, got {}",
            config.archive.compression_level
        )));
    }
    if let Some(pattern) = config
        .integrity
        .duplicate_products
        .iter()
        .find(|p| p.key().is_empty())
    {
        return Err(ConfigError::ValidationError(format!(
            "empty duplicate product pattern: {pattern:?}"
        )));
    }
    Ok(())
}
