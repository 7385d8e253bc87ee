//! Parsing and validation of `strata.toml` cache configuration files.
//!
//! This crate reads the cache configuration file and produces a strongly-typed
//! [`CacheConfig`] describing the build root, both storage tiers, integrity
//! rules, and archive tuning.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, CONFIG_FILE};
pub use types::*;
