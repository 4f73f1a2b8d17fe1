//! Adaptor factory keyed by provider type.

use relay_core::{Adaptor, Channel, ChannelCredential, ProviderType, RelayError, RelayResult};
use std::sync::Arc;
use tracing::debug;

use crate::anthropic::AnthropicAdaptor;
use crate::baidu::BaiduAdaptor;
use crate::bedrock::BedrockAdaptor;
use crate::credential_cache::CredentialCache;
use crate::minimax::MiniMaxAdaptor;
use crate::openai::OpenAIAdaptor;
use crate::requester::HttpRequester;
use crate::xunfei::XunfeiAdaptor;
use crate::zhipu::ZhipuAdaptor;

/// Builds the adaptor for a channel
pub trait AdaptorFactory: Send + Sync {
    /// Adaptor for `channel`; fails when the channel key is malformed
    fn create(&self, channel: &Channel) -> RelayResult<Arc<dyn Adaptor>>;
}

/// Shared state handed to every adaptor
#[derive(Debug, Clone)]
pub struct ProviderContext {
    /// Pooled HTTP transport
    pub requester: Arc<HttpRequester>,
    /// Derived credentials (Zhipu JWTs, Baidu access tokens)
    pub tokens: Arc<CredentialCache<String>>,
}

impl ProviderContext {
    /// Create a context around `requester` with an empty credential cache
    #[must_use]
    pub fn new(requester: Arc<HttpRequester>) -> Self {
        Self {
            requester,
            tokens: Arc::new(CredentialCache::new()),
        }
    }
}

/// Factory covering every built-in provider family
#[derive(Debug, Clone)]
pub struct DefaultAdaptorFactory {
    context: ProviderContext,
}

impl DefaultAdaptorFactory {
    /// Create a factory
    #[must_use]
    pub fn new(context: ProviderContext) -> Self {
        Self { context }
    }

    /// Shared provider context
    #[must_use]
    pub fn context(&self) -> &ProviderContext {
        &self.context
    }
}

impl AdaptorFactory for DefaultAdaptorFactory {
    fn create(&self, channel: &Channel) -> RelayResult<Arc<dyn Adaptor>> {
        let credential = ChannelCredential::from_channel(channel)?;
        let requester = Arc::clone(&self.context.requester);
        let channel = channel.clone();
        debug!(channel_id = channel.id, provider = %channel.provider.as_str(), "Building adaptor");

        let adaptor: Arc<dyn Adaptor> = match (channel.provider, credential) {
            (
                ProviderType::OpenAI
                | ProviderType::Azure
                | ProviderType::Custom
                | ProviderType::DeepSeek
                | ProviderType::Mistral
                | ProviderType::Groq
                | ProviderType::Moonshot,
                ChannelCredential::ApiKey(key),
            ) => Arc::new(OpenAIAdaptor::new(channel, key, requester)),
            (ProviderType::Anthropic, ChannelCredential::ApiKey(key)) => {
                Arc::new(AnthropicAdaptor::new(channel, key, requester))
            }
            (ProviderType::Bedrock, ChannelCredential::Bedrock(aws)) => {
                Arc::new(BedrockAdaptor::new(channel, aws, requester))
            }
            (ProviderType::Zhipu, ChannelCredential::Zhipu { id, secret }) => Arc::new(
                ZhipuAdaptor::new(channel, id, secret, Arc::clone(&self.context.tokens), requester),
            ),
            (
                ProviderType::Baidu,
                ChannelCredential::Baidu {
                    client_id,
                    client_secret,
                },
            ) => Arc::new(BaiduAdaptor::new(
                channel,
                client_id,
                client_secret,
                Arc::clone(&self.context.tokens),
                requester,
            )),
            (ProviderType::MiniMax, ChannelCredential::MiniMax { api_key, group_id }) => {
                Arc::new(MiniMaxAdaptor::new(channel, api_key, group_id, requester))
            }
            (
                ProviderType::Xunfei,
                ChannelCredential::Xunfei {
                    app_id,
                    api_key,
                    api_secret,
                },
            ) => Arc::new(XunfeiAdaptor::new(
                channel, app_id, api_key, api_secret, requester,
            )),
            (provider, _) => {
                return Err(RelayError::channel_config(format!(
                    "credential does not match provider {}",
                    provider.as_str()
                )))
            }
        };
        Ok(adaptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::RequesterConfig;

    fn factory() -> DefaultAdaptorFactory {
        let requester = Arc::new(HttpRequester::new(RequesterConfig::default()).unwrap());
        DefaultAdaptorFactory::new(ProviderContext::new(requester))
    }

    #[test]
    fn test_builds_adaptor_per_provider() {
        let factory = factory();
        let cases = [
            (ProviderType::OpenAI, "sk-test"),
            (ProviderType::DeepSeek, "sk-test"),
            (ProviderType::Anthropic, "sk-ant"),
            (ProviderType::Bedrock, "us-east-1|AKIA|secret"),
            (ProviderType::Zhipu, "id.secret"),
            (ProviderType::Baidu, "cid|csecret"),
            (ProviderType::MiniMax, "key|group"),
            (ProviderType::Xunfei, "app|key|secret"),
        ];

        for (provider, key) in cases {
            let channel = Channel::new(1, "c", provider, key);
            let adaptor = factory.create(&channel).unwrap();
            assert_eq!(adaptor.provider_type(), provider);
        }
    }

    #[test]
    fn test_capabilities_by_family() {
        let factory = factory();
        let bedrock = factory
            .create(&Channel::new(1, "b", ProviderType::Bedrock, "us-east-1|AKIA|secret"))
            .unwrap();
        assert!(bedrock.chat().is_some());
        assert!(bedrock.embeddings().is_none());

        let xunfei = factory
            .create(&Channel::new(2, "x", ProviderType::Xunfei, "app|key|secret"))
            .unwrap();
        assert!(xunfei.chat().is_some());
        assert!(xunfei.embeddings().is_none());
    }

    #[test]
    fn test_malformed_key_fails_closed() {
        let factory = factory();
        let err = factory
            .create(&Channel::new(3, "m", ProviderType::MiniMax, "missing-group"))
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::ChannelConfig { .. }));
        assert_eq!(err.status_code(), 500);
    }
}
