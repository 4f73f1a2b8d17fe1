//! Configuration loading.
//!
//! Resolution order: defaults, then the config file (`RELAY_CONFIG`, or
//! `config.yaml` when present), then `RELAY_*` environment overrides. The
//! result is validated before it is returned.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use validator::Validate;

use crate::schema::RelayConfig;

static ENV_PLACEHOLDER: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}"));

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// Unknown file extension
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Environment override has a bad value
    #[error("invalid value for {key}: {value}")]
    InvalidEnv {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },

    /// Validation failed
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Load configuration from the default locations
pub async fn load_config() -> Result<RelayConfig, ConfigError> {
    let path = std::env::var("RELAY_CONFIG").ok().map(PathBuf::from).or_else(|| {
        let default = PathBuf::from("config.yaml");
        default.exists().then_some(default)
    });

    let mut config = match path {
        Some(path) => read_file(&path).await?,
        None => {
            info!("No config file found, using defaults");
            RelayConfig::default()
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load and validate a specific config file, without environment overrides
pub async fn load_config_from(path: impl AsRef<Path>) -> Result<RelayConfig, ConfigError> {
    let config = read_file(path.as_ref()).await?;
    config.validate()?;
    Ok(config)
}

async fn read_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let expanded = expand_env(&raw, |key| std::env::var(key).ok());

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    debug!(path = %path.display(), format = %extension, "Loading config file");
    parse(&expanded, &extension)
}

/// Parse config text in the given format (`yaml`, `yml` or `toml`)
pub fn parse(raw: &str, format: &str) -> Result<RelayConfig, ConfigError> {
    match format {
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string())),
        "toml" => toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Replace `${VAR}` placeholders; unknown variables become empty strings
fn expand_env<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match ENV_PLACEHOLDER.as_ref() {
        Ok(re) => re
            .replace_all(raw, |caps: &regex::Captures<'_>| lookup(&caps[1]).unwrap_or_default())
            .into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn apply_env_overrides<F>(config: &mut RelayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
        value
            .parse()
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            })
    }

    if let Some(host) = lookup("RELAY_HOST") {
        config.server.host = host;
    }
    if let Some(port) = lookup("RELAY_PORT") {
        config.server.port = parsed("RELAY_PORT", port)?;
    }
    if let Some(retry) = lookup("RELAY_RETRY_TIMES") {
        config.relay.retry_times = parsed("RELAY_RETRY_TIMES", retry)?;
    }
    if let Some(proxy) = lookup("RELAY_PROXY") {
        config.relay.proxy = Some(proxy).filter(|p| !p.is_empty());
    }
    if let Some(level) = lookup("RELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("RELAY_LOG_JSON") {
        config.logging.json = parsed("RELAY_LOG_JSON", json)?;
    }
    Ok(())
}
