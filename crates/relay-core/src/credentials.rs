//! Structured channel credentials.
//!
//! Some providers need more than one secret. Operators store them in the channel
//! key joined by `|` (or `.` for Zhipu). They are parsed once, when an adaptor is
//! built, and a malformed key fails closed before any request is sent.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::error::RelayError;
use crate::types::{Channel, ProviderType};

/// Credential parsing failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The key is empty
    #[error("{provider} channel key is empty")]
    Empty {
        /// Provider family
        provider: ProviderType,
    },
    /// The key does not have the expected shape
    #[error("{provider} channel key must look like {expected}")]
    Malformed {
        /// Provider family
        provider: ProviderType,
        /// Expected layout
        expected: &'static str,
    },
}

impl From<CredentialError> for RelayError {
    fn from(err: CredentialError) -> Self {
        Self::channel_config(err.to_string())
    }
}

/// AWS access credentials for Bedrock
#[derive(Clone)]
pub struct AwsCredential {
    /// AWS region
    pub region: String,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
    /// Session token for temporary credentials
    pub session_token: Option<SecretString>,
}

impl fmt::Debug for AwsCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredential")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Parsed channel credential
#[derive(Debug, Clone)]
pub enum ChannelCredential {
    /// Single bearer key
    ApiKey(SecretString),
    /// `region|access_key|secret_key[|session_token]`
    Bedrock(AwsCredential),
    /// `api_key|group_id`
    MiniMax {
        /// API key
        api_key: SecretString,
        /// Account group ID, sent as the `GroupId` query parameter
        group_id: String,
    },
    /// `app_id|api_key|api_secret`
    Xunfei {
        /// Application ID
        app_id: String,
        /// API key
        api_key: String,
        /// API secret used for URL signing
        api_secret: SecretString,
    },
    /// `id.secret`
    Zhipu {
        /// Key ID
        id: String,
        /// Signing secret
        secret: SecretString,
    },
    /// `client_id|client_secret`
    Baidu {
        /// OAuth client ID
        client_id: String,
        /// OAuth client secret
        client_secret: SecretString,
    },
}

impl ChannelCredential {
    /// Parse the key of `channel` according to its provider
    pub fn from_channel(channel: &Channel) -> Result<Self, CredentialError> {
        Self::parse(channel.provider, channel.key.expose_secret())
    }

    /// Parse a raw key for `provider`
    pub fn parse(provider: ProviderType, raw: &str) -> Result<Self, CredentialError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CredentialError::Empty { provider });
        }

        let malformed = |expected| CredentialError::Malformed { provider, expected };

        match provider {
            ProviderType::Bedrock => {
                let parts = split_parts(raw, '|');
                match parts.as_slice() {
                    [region, ak, sk] => Ok(Self::Bedrock(AwsCredential {
                        region: (*region).to_string(),
                        access_key_id: (*ak).to_string(),
                        secret_access_key: secret(sk),
                        session_token: None,
                    })),
                    [region, ak, sk, session] => Ok(Self::Bedrock(AwsCredential {
                        region: (*region).to_string(),
                        access_key_id: (*ak).to_string(),
                        secret_access_key: secret(sk),
                        session_token: Some(secret(session)),
                    })),
                    _ => Err(malformed("region|access_key|secret_key[|session_token]")),
                }
            }
            ProviderType::MiniMax => match split_parts(raw, '|').as_slice() {
                [key, group] => Ok(Self::MiniMax {
                    api_key: secret(key),
                    group_id: (*group).to_string(),
                }),
                _ => Err(malformed("api_key|group_id")),
            },
            ProviderType::Xunfei => match split_parts(raw, '|').as_slice() {
                [app_id, api_key, api_secret] => Ok(Self::Xunfei {
                    app_id: (*app_id).to_string(),
                    api_key: (*api_key).to_string(),
                    api_secret: secret(api_secret),
                }),
                _ => Err(malformed("app_id|api_key|api_secret")),
            },
            ProviderType::Zhipu => match split_parts(raw, '.').as_slice() {
                [id, key_secret] => Ok(Self::Zhipu {
                    id: (*id).to_string(),
                    secret: secret(key_secret),
                }),
                _ => Err(malformed("id.secret")),
            },
            ProviderType::Baidu => match split_parts(raw, '|').as_slice() {
                [client_id, client_secret] => Ok(Self::Baidu {
                    client_id: (*client_id).to_string(),
                    client_secret: secret(client_secret),
                }),
                _ => Err(malformed("client_id|client_secret")),
            },
            _ => Ok(Self::ApiKey(secret(raw))),
        }
    }

    /// The bearer key, for providers that use one
    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        match self {
            Self::ApiKey(key) | Self::MiniMax { api_key: key, .. } => Some(key.expose_secret()),
            _ => None,
        }
    }
}

/// Split on `sep`, rejecting the whole key when any part is blank
fn split_parts(raw: &str, sep: char) -> Vec<&str> {
    let parts: Vec<&str> = raw.split(sep).map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Vec::new();
    }
    parts
}

fn secret(value: &str) -> SecretString {
    SecretString::new(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bedrock_with_and_without_session() {
        let cred = ChannelCredential::parse(ProviderType::Bedrock, "us-east-1|AKIA|secret").unwrap();
        match cred {
            ChannelCredential::Bedrock(aws) => {
                assert_eq!(aws.region, "us-east-1");
                assert_eq!(aws.access_key_id, "AKIA");
                assert_eq!(aws.secret_access_key.expose_secret(), "secret");
                assert!(aws.session_token.is_none());
            }
            other => panic!("unexpected credential: {other:?}"),
        }

        let cred =
            ChannelCredential::parse(ProviderType::Bedrock, "us-east-1|AKIA|secret|session").unwrap();
        assert!(matches!(cred, ChannelCredential::Bedrock(AwsCredential { session_token: Some(_), .. })));
    }

    #[test]
    fn test_malformed_keys_fail_closed() {
        assert!(ChannelCredential::parse(ProviderType::Bedrock, "us-east-1|AKIA").is_err());
        assert!(ChannelCredential::parse(ProviderType::Bedrock, "a|b|c|d|e").is_err());
        assert!(ChannelCredential::parse(ProviderType::MiniMax, "key-only").is_err());
        assert!(ChannelCredential::parse(ProviderType::MiniMax, "key|").is_err());
        assert!(ChannelCredential::parse(ProviderType::Xunfei, "app|key").is_err());
        assert!(ChannelCredential::parse(ProviderType::Zhipu, "no-dot").is_err());
        assert_eq!(
            ChannelCredential::parse(ProviderType::OpenAI, "  ").unwrap_err(),
            CredentialError::Empty {
                provider: ProviderType::OpenAI
            }
        );
    }

    #[test]
    fn test_minimax_and_xunfei() {
        let cred = ChannelCredential::parse(ProviderType::MiniMax, "mm-key|1780").unwrap();
        assert_eq!(cred.bearer(), Some("mm-key"));
        assert!(matches!(cred, ChannelCredential::MiniMax { ref group_id, .. } if group_id == "1780"));

        let cred = ChannelCredential::parse(ProviderType::Xunfei, "app|key|secret").unwrap();
        assert!(matches!(cred, ChannelCredential::Xunfei { ref app_id, .. } if app_id == "app"));
        assert_eq!(cred.bearer(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cred = ChannelCredential::parse(ProviderType::Bedrock, "us-east-1|AKIA|topsecret").unwrap();
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("topsecret"));
    }
}
