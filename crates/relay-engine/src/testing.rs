//! Shared fixtures for engine tests.

use bytes::Bytes;
use futures::StreamExt;
use relay_billing::ModelPricingTable;
use relay_core::{ApiToken, Channel, ChatCompletionRequest, ChatMessage, MemoryDatastore, Price, ProviderType, User};
use relay_providers::{DefaultAdaptorFactory, HttpRequester, ProviderContext, RequesterConfig};
use relay_resilience::{FailoverConfig, HealthConfig, ResponseCache};
use relay_routing::ChannelSelector;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::RelayEngine;
use crate::stream::SseStream;

pub(crate) struct Harness {
    pub engine: Arc<RelayEngine>,
    pub store: Arc<MemoryDatastore>,
}

impl Harness {
    /// Store a fresh token 1 holding `quota` and return it.
    ///
    /// Its owner, user 1, holds the same amount so reservations are held
    /// rather than skipped as trusted.
    pub fn token(&self, quota: i64) -> ApiToken {
        self.store.upsert_user(User { id: 1, quota });
        let token = ApiToken {
            id: 1,
            user_id: 1,
            name: "test".to_string(),
            key: "sk-relay-test".to_string(),
            group: "default".to_string(),
            remain_quota: quota,
            unlimited_quota: false,
            chat_cache: false,
            allow_channel_pin: true,
            enabled: true,
            expires_at: None,
        };
        self.store.upsert_token(token.clone());
        token
    }
}

/// Channel of `provider` served under `{uri}/c{id}`
pub(crate) fn channel(id: i64, uri: &str, provider: ProviderType) -> Channel {
    Channel::new(id, format!("channel-{id}"), provider, "sk-upstream")
        .with_base_url(format!("{uri}/c{id}"))
        .with_models(["gpt-3.5-turbo"])
        .with_groups(["default"])
}

pub(crate) fn openai_channel(id: i64, uri: &str) -> Channel {
    channel(id, uri, ProviderType::OpenAI)
}

pub(crate) fn prices() -> Vec<Price> {
    vec![
        Price::tokens("gpt-3.5-turbo", 0.75, 1.0),
        Price::tokens("gpt-3.5-turbo-instruct", 0.75, 1.0),
        Price::tokens("text-embedding-ada-002", 0.05, 0.0),
        Price::tokens("text-moderation-latest", 0.1, 0.0),
        Price::tokens("tts-1", 7.5, 0.0),
        Price::tokens("whisper-1", 15.0, 15.0),
        Price::tokens("dall-e-3", 0.02, 0.0),
    ]
}

pub(crate) async fn harness(channels: Vec<Channel>, retry_times: u32) -> Harness {
    let store = MemoryDatastore::shared();
    for channel in channels {
        store.upsert_channel(channel);
    }
    let selector = Arc::new(ChannelSelector::with_seed(7));
    selector.refresh(store.as_ref()).await.unwrap();

    let requester = Arc::new(HttpRequester::new(RequesterConfig::default().with_timeout(Duration::from_secs(5))).unwrap());
    let factory = Arc::new(DefaultAdaptorFactory::new(ProviderContext::new(requester)));

    let engine = RelayEngine::builder()
        .store(store.clone())
        .factory(factory)
        .selector(selector)
        .pricing(Arc::new(ModelPricingTable::new(prices(), Default::default())))
        .cache(ResponseCache::in_memory(64, Duration::from_secs(300), true))
        .failover(FailoverConfig {
            retry_times,
            ..FailoverConfig::default()
        })
        .health(HealthConfig {
            automatic_disable: true,
            automatic_enable: true,
        })
        .build()
        .unwrap();

    Harness {
        engine: Arc::new(engine),
        store,
    }
}

pub(crate) fn chat_body(stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest::builder()
        .model("gpt-3.5-turbo")
        .message(ChatMessage::user("Say hello"))
        .stream(stream)
        .build()
        .unwrap()
}

/// SSE body of `events` terminated by `[DONE]`
pub(crate) fn sse_body(events: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub(crate) async fn collect(stream: SseStream) -> String {
    let frames: Vec<Bytes> = stream.collect().await;
    frames.iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect()
}
