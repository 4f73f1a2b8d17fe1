//! Configuration schema.

use relay_core::{ApiToken, Channel, ChannelId, ChannelStatus, Price, ProviderType, User};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_token_owners"))]
pub struct RelayConfig {
    /// HTTP server settings
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    /// Relay engine settings
    #[serde(default)]
    #[validate(nested)]
    pub relay: RelaySettings,

    /// Chat response cache
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Pricing and group ratios
    #[serde(default)]
    pub billing: BillingConfig,

    /// Logging
    #[serde(default)]
    pub logging: LogConfig,

    /// Channels loaded into the datastore at startup
    #[serde(default)]
    #[validate(nested)]
    pub channels: Vec<ChannelConfig>,

    /// Users loaded into the datastore at startup
    #[serde(default)]
    pub users: Vec<User>,

    /// Tokens loaded into the datastore at startup; each owner must be a configured user
    #[serde(default)]
    pub tokens: Vec<ApiToken>,
}

fn validate_token_owners(config: &RelayConfig) -> Result<(), ValidationError> {
    let users: HashSet<_> = config.users.iter().map(|u| u.id).collect();
    match config.tokens.iter().find(|t| !users.contains(&t.user_id)) {
        Some(token) => Err(ValidationError::new("unknown_token_owner").with_message(
            format!("token {} belongs to unknown user {}", token.id, token.user_id).into(),
        )),
        None => Ok(()),
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Maximum request body size in bytes
    #[serde(default = "default_body_limit")]
    #[validate(range(min = 1024))]
    pub body_limit: usize,

    /// Time allowed for in-flight requests at shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit: default_body_limit(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Relay engine settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RelaySettings {
    /// Additional channels tried after the first failure
    #[serde(default)]
    #[validate(range(max = 10))]
    pub retry_times: u32,

    /// How long a failed channel is skipped; zero disables cooldown
    #[serde(default = "default_retry_cooldown", with = "humantime_serde")]
    pub retry_cooldown: Duration,

    /// Pause before each retry
    #[serde(default, with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Upstream request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Upstream connect timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Global outbound proxy (http, https or socks5)
    #[serde(default)]
    #[validate(url)]
    pub proxy: Option<String>,

    /// Quota reserved on top of the prompt estimate
    #[serde(default)]
    #[validate(range(min = 0))]
    pub pre_consumed_quota: i64,

    /// Disable channels whose errors indicate a broken account
    #[serde(default = "default_true")]
    pub automatic_disable_channel: bool,

    /// Re-enable auto-disabled channels that pass a probe
    #[serde(default)]
    pub automatic_enable_channel: bool,

    /// Channel index rebuild interval
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub channel_refresh_interval: Duration,

    /// Health probe sweep interval
    #[serde(default, with = "humantime_serde")]
    pub channel_test_interval: Option<Duration>,

    /// Balance sweep interval
    #[serde(default, with = "humantime_serde")]
    pub balance_update_interval: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_times: 0,
            retry_cooldown: default_retry_cooldown(),
            retry_delay: Duration::ZERO,
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            proxy: None,
            pre_consumed_quota: 0,
            automatic_disable_channel: true,
            automatic_enable_channel: false,
            channel_refresh_interval: default_refresh_interval(),
            channel_test_interval: None,
            balance_update_interval: None,
        }
    }
}

/// Chat response cache
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    /// Enable the cache globally; tokens still have to opt in
    #[serde(default)]
    pub enabled: bool,

    /// Entry lifetime
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum entries kept in memory
    #[serde(default = "default_cache_entries")]
    #[validate(range(min = 1))]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: default_cache_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

/// Pricing and group ratios
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Multiplier per token group; missing groups use 1.0
    #[serde(default)]
    pub group_ratios: HashMap<String, f64>,

    /// Model prices
    #[serde(default)]
    pub prices: Vec<Price>,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level filter; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Channel record loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChannelConfig {
    /// Channel ID
    pub id: ChannelId,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Provider family
    pub provider: ProviderType,

    /// Credential, composite keys joined by `|`
    #[validate(length(min = 1))]
    pub key: String,

    /// Base URL override
    #[serde(default)]
    #[validate(url)]
    pub base_url: Option<String>,

    /// Proxy override
    #[serde(default)]
    #[validate(url)]
    pub proxy: Option<String>,

    /// Provider API version
    #[serde(default)]
    pub api_version: Option<String>,

    /// Groups served
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// Models served
    #[serde(default)]
    pub models: Vec<String>,

    /// Caller model to upstream model
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    /// Priority tier
    #[serde(default)]
    pub priority: i64,

    /// Weight within the tier
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Only serves plain chat requests
    #[serde(default)]
    pub only_chat: bool,

    /// Model used by health probes
    #[serde(default)]
    pub test_model: Option<String>,

    /// Initial status
    #[serde(default)]
    pub status: ChannelStatus,
}

impl ChannelConfig {
    /// Convert into a datastore record
    #[must_use]
    pub fn to_channel(&self) -> Channel {
        let mut channel = Channel::new(self.id, self.name.clone(), self.provider, self.key.trim())
            .with_groups(self.groups.iter().cloned())
            .with_models(self.models.iter().cloned())
            .with_priority(self.priority)
            .with_weight(self.weight)
            .with_status(self.status);

        if !self.model_mapping.is_empty() {
            if let Ok(mapping) = serde_json::to_string(&self.model_mapping) {
                channel = channel.with_model_mapping(mapping);
            }
        }
        channel.base_url = self.base_url.clone();
        channel.proxy = self.proxy.clone();
        channel.api_version = self.api_version.clone();
        channel.only_chat = self.only_chat;
        channel.test_model = self.test_model.clone();
        channel
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_body_limit() -> usize {
    32 * 1024 * 1024
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_cooldown() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}
