//! Router fixtures.

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use relay_billing::ModelPricingTable;
use relay_core::{ApiToken, Channel, MemoryDatastore, Price, ProviderType, User};
use relay_engine::RelayEngine;
use relay_providers::{DefaultAdaptorFactory, HttpRequester, ProviderContext, RequesterConfig};
use relay_routing::ChannelSelector;
use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

pub(crate) const KEY: &str = "sk-relay-test";

pub(crate) fn token(allow_pin: bool) -> ApiToken {
    ApiToken {
        id: 1,
        user_id: 1,
        name: "test".to_string(),
        key: KEY.to_string(),
        group: "default".to_string(),
        remain_quota: 100_000,
        unlimited_quota: false,
        chat_cache: false,
        allow_channel_pin: allow_pin,
        enabled: true,
        expires_at: None,
    }
}

/// OpenAI channel served under `{uri}/c{id}`
pub(crate) fn channel(id: i64, uri: &str) -> Channel {
    Channel::new(id, format!("channel-{id}"), ProviderType::OpenAI, "sk-upstream")
        .with_base_url(format!("{uri}/c{id}"))
        .with_models(["gpt-3.5-turbo", "text-embedding-ada-002", "tts-1"])
        .with_groups(["default"])
}

pub(crate) async fn state(channels: Vec<Channel>, token: ApiToken) -> (AppState, Arc<MemoryDatastore>) {
    let store = MemoryDatastore::shared();
    for channel in channels {
        store.upsert_channel(channel);
    }
    store.upsert_user(User {
        id: token.user_id,
        quota: token.remain_quota,
    });
    store.upsert_token(token);

    let selector = Arc::new(ChannelSelector::with_seed(3));
    selector.refresh(store.as_ref()).await.unwrap();
    let requester =
        Arc::new(HttpRequester::new(RequesterConfig::default().with_timeout(Duration::from_secs(5))).unwrap());
    let prices = vec![
        Price::tokens("gpt-3.5-turbo", 0.75, 1.0),
        Price::tokens("text-embedding-ada-002", 0.05, 0.0),
        Price::tokens("tts-1", 7.5, 0.0),
    ];

    let engine = RelayEngine::builder()
        .store(store.clone())
        .factory(Arc::new(DefaultAdaptorFactory::new(ProviderContext::new(requester))))
        .selector(selector)
        .pricing(Arc::new(ModelPricingTable::new(prices, Default::default())))
        .build()
        .unwrap();
    (AppState::new(Arc::new(engine)), store)
}

pub(crate) fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub(crate) fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {KEY}"))
        .body(Body::empty())
        .unwrap()
}

pub(crate) async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub(crate) async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}
