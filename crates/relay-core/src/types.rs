//! Domain records: channels, tokens, prices and usage logs.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{RelayError, RelayResult};

/// Channel identifier
pub type ChannelId = i64;
/// User identifier
pub type UserId = i64;
/// Token identifier
pub type TokenId = i64;

/// Channel lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Eligible for selection
    #[default]
    Enabled,
    /// Disabled by an operator, never re-enabled automatically
    ManuallyDisabled,
    /// Disabled by error classification
    AutoDisabled,
}

impl ChannelStatus {
    /// Whether the channel may serve traffic
    #[must_use]
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Upstream provider family served by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenAI
    OpenAI,
    /// Azure OpenAI
    Azure,
    /// Any OpenAI-compatible endpoint
    Custom,
    /// DeepSeek (OpenAI wire format)
    DeepSeek,
    /// Mistral (OpenAI wire format)
    Mistral,
    /// Groq (OpenAI wire format)
    Groq,
    /// Moonshot (OpenAI wire format)
    Moonshot,
    /// Anthropic Claude
    Anthropic,
    /// AWS Bedrock (Claude family)
    Bedrock,
    /// Zhipu GLM
    Zhipu,
    /// Baidu ERNIE
    Baidu,
    /// MiniMax
    MiniMax,
    /// iFlytek Xunfei Spark
    Xunfei,
}

impl ProviderType {
    /// Provider name as used in config and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Azure => "azure",
            Self::Custom => "custom",
            Self::DeepSeek => "deepseek",
            Self::Mistral => "mistral",
            Self::Groq => "groq",
            Self::Moonshot => "moonshot",
            Self::Anthropic => "anthropic",
            Self::Bedrock => "bedrock",
            Self::Zhipu => "zhipu",
            Self::Baidu => "baidu",
            Self::MiniMax => "minimax",
            Self::Xunfei => "xunfei",
        }
    }

    /// Default upstream base URL
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAI | Self::Custom => "https://api.openai.com",
            Self::Azure => "",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::Mistral => "https://api.mistral.ai",
            Self::Groq => "https://api.groq.com/openai",
            Self::Moonshot => "https://api.moonshot.cn",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Bedrock => "",
            Self::Zhipu => "https://open.bigmodel.cn/api/paas/v4",
            Self::Baidu => "https://aip.baidubce.com",
            Self::MiniMax => "https://api.minimax.chat/v1",
            Self::Xunfei => "wss://spark-api.xf-yun.com",
        }
    }

    /// Speaks the OpenAI wire format natively
    #[must_use]
    pub fn is_openai_compatible(self) -> bool {
        matches!(
            self,
            Self::OpenAI
                | Self::Azure
                | Self::Custom
                | Self::DeepSeek
                | Self::Mistral
                | Self::Groq
                | Self::Moonshot
        )
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured upstream account
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel ID
    pub id: ChannelId,
    /// Display name
    pub name: String,
    /// Provider family
    pub provider: ProviderType,
    /// Lifecycle status
    pub status: ChannelStatus,
    /// Raw credential, possibly composite (`a|b|c`)
    pub key: SecretString,
    /// Base URL override
    pub base_url: Option<String>,
    /// Outbound proxy override (http, https or socks5 URL)
    pub proxy: Option<String>,
    /// Provider API version (Azure api-version, Xunfei domain version)
    pub api_version: Option<String>,
    /// Groups served
    pub groups: Vec<String>,
    /// Models served, trailing `*` allowed
    pub models: Vec<String>,
    /// Raw JSON object mapping caller model names to upstream names
    pub model_mapping: Option<String>,
    /// Higher priority tiers are tried first
    pub priority: i64,
    /// Relative weight within a tier, 0 means default
    pub weight: u32,
    /// Only serves plain chat requests
    pub only_chat: bool,
    /// Model used by health probes
    pub test_model: Option<String>,
    /// Last known upstream balance
    pub balance: f64,
    /// Last measured response time
    pub response_time_ms: u64,
}

impl Channel {
    /// Create a channel with defaults for the optional fields
    #[must_use]
    pub fn new(id: ChannelId, name: impl Into<String>, provider: ProviderType, key: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            provider,
            status: ChannelStatus::Enabled,
            key: SecretString::new(key.into()),
            base_url: None,
            proxy: None,
            api_version: None,
            groups: vec!["default".to_string()],
            models: Vec::new(),
            model_mapping: None,
            priority: 0,
            weight: 1,
            only_chat: false,
            test_model: None,
            balance: 0.0,
            response_time_ms: 0,
        }
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the served models
    #[must_use]
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Set the served groups
    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the model mapping JSON
    #[must_use]
    pub fn with_model_mapping(mut self, mapping: impl Into<String>) -> Self {
        self.model_mapping = Some(mapping.into());
        self
    }

    /// Set the status
    #[must_use]
    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the channel may serve traffic
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    /// Base URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Whether this channel serves `model` for `group`
    #[must_use]
    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group)
            && self.models.iter().any(|pattern| model_matches(pattern, model))
    }

    /// Translate a caller model name into the upstream name.
    ///
    /// Unmapped names pass through unchanged. Fails only when the mapping is not
    /// a JSON object of strings.
    pub fn map_model(&self, model: &str) -> RelayResult<String> {
        let Some(raw) = self.model_mapping.as_deref().map(str::trim) else {
            return Ok(model.to_string());
        };
        if raw.is_empty() || raw == "{}" {
            return Ok(model.to_string());
        }

        let mapping: HashMap<String, String> = serde_json::from_str(raw).map_err(|e| {
            RelayError::channel_config(format!(
                "channel {} has a malformed model mapping: {e}",
                self.id
            ))
        })?;

        Ok(mapping
            .get(model)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string()))
    }
}

/// Match a model against a pattern where a trailing `*` is a prefix wildcard
#[must_use]
pub fn model_matches(pattern: &str, model: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => model.starts_with(prefix),
        None => pattern == model,
    }
}

/// Account that owns tokens; its quota backs every token it holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: UserId,
    /// Remaining quota shared by the user's tokens
    #[serde(default)]
    pub quota: i64,
}

/// Caller API token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    /// Token ID
    pub id: TokenId,
    /// Owning user
    pub user_id: UserId,
    /// Display name
    pub name: String,
    /// Bearer key presented by the caller
    pub key: String,
    /// Routing group
    #[serde(default = "default_group")]
    pub group: String,
    /// Remaining quota
    #[serde(default)]
    pub remain_quota: i64,
    /// Skips quota accounting entirely
    #[serde(default)]
    pub unlimited_quota: bool,
    /// Opts into the chat response cache
    #[serde(default)]
    pub chat_cache: bool,
    /// May pin a specific channel
    #[serde(default)]
    pub allow_channel_pin: bool,
    /// Token is active
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Expiry
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl ApiToken {
    /// Whether the token can be used right now
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && self.expires_at.map_or(true, |at| at > Utc::now())
    }
}

/// How a model is priced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    /// Per token
    #[default]
    Tokens,
    /// Fixed amount per call
    Times,
}

/// Price entry for a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    /// Model name, trailing `*` allowed
    pub model: String,
    /// Pricing kind
    #[serde(rename = "type", default)]
    pub price_type: PriceType,
    /// Provider that natively serves the model
    #[serde(default)]
    pub channel_type: Option<ProviderType>,
    /// Input ratio (quota per prompt token, or per-call base for `times`)
    pub input: f64,
    /// Output ratio (quota per completion token)
    #[serde(default)]
    pub output: f64,
    /// Owner label for model listings
    #[serde(default)]
    pub owned_by: Option<String>,
}

impl Price {
    /// Token price entry
    #[must_use]
    pub fn tokens(model: impl Into<String>, input: f64, output: f64) -> Self {
        Self {
            model: model.into(),
            price_type: PriceType::Tokens,
            channel_type: None,
            input,
            output,
            owned_by: None,
        }
    }

    /// Per-call price entry
    #[must_use]
    pub fn times(model: impl Into<String>, input: f64) -> Self {
        Self {
            model: model.into(),
            price_type: PriceType::Times,
            channel_type: None,
            input,
            output: 0.0,
            owned_by: None,
        }
    }
}

/// Settled usage record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLog {
    /// User charged
    pub user_id: UserId,
    /// Token charged
    pub token_id: TokenId,
    /// Token name at the time of the call
    pub token_name: String,
    /// Channel that served the request
    pub channel_id: ChannelId,
    /// Caller-facing model name
    pub model: String,
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Quota charged
    pub quota: i64,
    /// Wall time of the relay in milliseconds
    pub request_time_ms: u64,
    /// Whether the response was streamed
    pub is_stream: bool,
    /// Free-form pricing summary
    pub content: String,
    /// When the log was written
    pub created_at: DateTime<Utc>,
}
