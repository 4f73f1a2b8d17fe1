//! Error types for the relay.
//!
//! Every failure that can reach a caller is a [`RelayError`]. Each variant maps
//! to an HTTP status and to the OpenAI error envelope
//! `{"error":{"message","type","param","code"}}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result alias used across the relay crates
pub type RelayResult<T> = Result<T, RelayError>;

/// Error `code` field: upstreams send either strings or integers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    /// Integer code
    Int(i64),
    /// String code
    Text(String),
}

impl ErrorCode {
    /// String view of the code, if it is textual
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(code) => write!(f, "{code}"),
            Self::Text(code) => f.write_str(code),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ErrorCode {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// OpenAI-compatible error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAIError {
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Error type, e.g. `invalid_request_error`
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Offending parameter
    #[serde(default)]
    pub param: Option<String>,
    /// Error code
    #[serde(default)]
    pub code: Option<ErrorCode>,
}

impl OpenAIError {
    /// Create a new error object
    #[must_use]
    pub fn new(
        message: impl Into<String>,
        error_type: impl Into<String>,
        code: impl Into<ErrorCode>,
    ) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            param: None,
            code: Some(code.into()),
        }
    }

    /// Set the `param` field
    #[must_use]
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Textual code, empty when absent or numeric
    #[must_use]
    pub fn code_str(&self) -> &str {
        self.code.as_ref().and_then(ErrorCode::as_str).unwrap_or("")
    }
}

/// Wire envelope wrapping an [`OpenAIError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAIErrorEnvelope {
    /// The error
    pub error: OpenAIError,
}

/// Why channel resolution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFailure {
    /// No channel is configured for the group/model pair
    NoneConfigured,
    /// Channels exist but all are disabled, cooling down or excluded
    Unavailable,
}

/// Main error type for the relay
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// Malformed caller request
    #[error("{message}")]
    Validation {
        /// Error message
        message: String,
        /// Offending field
        param: Option<String>,
        /// Machine readable code
        code: String,
    },

    /// Caller credentials rejected by the relay itself
    #[error("{message}")]
    Authentication {
        /// Error message
        message: String,
    },

    /// Requested resource does not exist
    #[error("{message}")]
    NotFound {
        /// Error message
        message: String,
        /// Machine readable code
        code: String,
    },

    /// Upstream returned a non-success status
    #[error("{}", error.message)]
    Upstream {
        /// HTTP status from the upstream
        status: u16,
        /// Normalized upstream error
        error: OpenAIError,
    },

    /// Request never produced an upstream status
    #[error("upstream request failed: {message}")]
    Transport {
        /// Error message
        message: String,
    },

    /// Upstream request exceeded the configured timeout
    #[error("upstream request timed out after {}s", timeout.as_secs())]
    Timeout {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// No channel could be resolved
    #[error("{message}")]
    Routing {
        /// Failure kind
        kind: RoutingFailure,
        /// Error message
        message: String,
    },

    /// User or token cannot cover the pre-consumed quota
    #[error("{message}")]
    QuotaExceeded {
        /// Error message
        message: String,
    },

    /// No price entry for the model
    #[error("pricing not found for model {model}")]
    PricingNotFound {
        /// Model name
        model: String,
    },

    /// The selected channel does not implement the requested action
    #[error("channel not implemented: {action}")]
    Unsupported {
        /// Requested action
        action: String,
    },

    /// Channel credential or mapping is malformed
    #[error("invalid channel configuration: {message}")]
    ChannelConfig {
        /// Error message
        message: String,
    },

    /// Persistence failure
    #[error("datastore error: {message}")]
    Datastore {
        /// Error message
        message: String,
    },

    /// Failure while reading an upstream stream
    #[error("stream error: {message}")]
    Stream {
        /// Error message
        message: String,
    },

    /// Internal relay failure
    #[error("{message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl RelayError {
    /// Create a validation error
    pub fn validation(
        message: impl Into<String>,
        param: Option<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            param,
            code: code.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Create an upstream error
    pub fn upstream(status: u16, error: OpenAIError) -> Self {
        Self::Upstream { status, error }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a routing error
    pub fn routing(kind: RoutingFailure, message: impl Into<String>) -> Self {
        Self::Routing {
            kind,
            message: message.into(),
        }
    }

    /// Create a quota error
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// Create an unsupported-capability error
    pub fn unsupported(action: impl Into<String>) -> Self {
        Self::Unsupported {
            action: action.into(),
        }
    }

    /// Create a channel configuration error
    pub fn channel_config(message: impl Into<String>) -> Self {
        Self::ChannelConfig {
            message: message.into(),
        }
    }

    /// Create a datastore error
    pub fn datastore(message: impl Into<String>) -> Self {
        Self::Datastore {
            message: message.into(),
        }
    }

    /// Create a stream error
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status used when rendering this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authentication { .. } => 401,
            Self::QuotaExceeded { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Upstream { status, .. } => *status,
            Self::Timeout { .. } => 504,
            Self::Routing { .. } | Self::PricingNotFound { .. } | Self::Unsupported { .. } => 503,
            Self::Transport { .. }
            | Self::ChannelConfig { .. }
            | Self::Datastore { .. }
            | Self::Stream { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Errors raised by the relay itself rather than by a channel.
    ///
    /// Local errors end the relay immediately: no retry, no channel health action.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::Authentication { .. }
                | Self::NotFound { .. }
                | Self::Routing { .. }
                | Self::QuotaExceeded { .. }
                | Self::PricingNotFound { .. }
                | Self::Unsupported { .. }
                | Self::Datastore { .. }
                | Self::Internal { .. }
        )
    }

    /// Normalized OpenAI error object for this error
    #[must_use]
    pub fn to_openai_error(&self) -> OpenAIError {
        let message = self.to_string();
        match self {
            Self::Upstream { error, .. } => error.clone(),
            Self::Validation { param, code, .. } => OpenAIError {
                message,
                error_type: "invalid_request_error".to_string(),
                param: param.clone(),
                code: Some(ErrorCode::Text(code.clone())),
            },
            Self::Authentication { .. } => {
                OpenAIError::new(message, "authentication_error", "invalid_api_key")
            }
            Self::NotFound { code, .. } => {
                OpenAIError::new(message, "invalid_request_error", code.as_str())
            }
            Self::Transport { .. } => OpenAIError::new(message, "relay_error", "do_request_failed"),
            Self::Timeout { .. } => OpenAIError::new(message, "relay_error", "upstream_timeout"),
            Self::Routing { kind, .. } => {
                let code = match kind {
                    RoutingFailure::NoneConfigured => "no_channel_configured",
                    RoutingFailure::Unavailable => "no_channel_available",
                };
                OpenAIError::new(message, "relay_error", code)
            }
            Self::QuotaExceeded { .. } => {
                OpenAIError::new(message, "relay_error", "insufficient_user_quota")
            }
            Self::PricingNotFound { .. } => {
                OpenAIError::new(message, "relay_error", "pricing_not_found")
            }
            Self::Unsupported { .. } => {
                OpenAIError::new(message, "channel_error", "channel_not_implemented")
            }
            Self::ChannelConfig { .. } => {
                OpenAIError::new(message, "channel_error", "invalid_channel_config")
            }
            Self::Datastore { .. } => OpenAIError::new(message, "relay_error", "datastore_error"),
            Self::Stream { .. } => OpenAIError::new(message, "relay_error", "stream_error"),
            Self::Internal { .. } => OpenAIError::new(message, "relay_error", "internal_error"),
        }
    }

    /// Wire envelope for this error
    #[must_use]
    pub fn to_envelope(&self) -> OpenAIErrorEnvelope {
        OpenAIErrorEnvelope {
            error: self.to_openai_error(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization error: {err}"))
    }
}
