//! # Relay Config
//!
//! Configuration management for the LLM relay:
//! - Typed configuration schema with defaults
//! - YAML and TOML files with `${VAR}` expansion
//! - `RELAY_*` environment overrides
//! - Validation before the relay starts

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from, parse, ConfigError};
pub use schema::{
    BillingConfig, CacheConfig, ChannelConfig, LogConfig, RelayConfig, RelaySettings,
    ServerConfig,
};
