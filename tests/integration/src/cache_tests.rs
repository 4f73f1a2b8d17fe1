//! Response cache: replays skip the upstream and are not charged again

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use pretty_assertions::assert_eq;
use wiremock::MockServer;

async fn cached_relay(upstream: &MockServer, cache: bool) -> TestRelay {
    TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, cache)).await
}

#[tokio::test]
async fn test_identical_request_replayed_from_cache() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("Paris.", 20, 5)).await;
    let relay = cached_relay(&upstream, true).await;

    let first = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    let first = TestRelay::json_body(expect_status(first, 200).await).await;
    let second = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    let second = TestRelay::json_body(expect_status(second, 200).await).await;

    assert_eq!(first, second);
    assert_eq!(chat_hits(&upstream, 1).await, 1);
    assert_eq!(relay.quota(), 500_000 - 20);
    assert_eq!(relay.store.usage_logs().len(), 1);
}

#[tokio::test]
async fn test_stream_replayed_from_cache() {
    let upstream = MockServer::start().await;
    let sse = openai_sse(&[openai_chunk("Bon"), openai_chunk("jour"), openai_usage_chunk(20, 2)]);
    mount_openai_stream(&upstream, 1, sse).await;
    let relay = cached_relay(&upstream, true).await;

    let first = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", true))
        .await;
    let first = expect_status(first, 200).await.text().await.unwrap();
    let second = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", true))
        .await;
    let second = expect_status(second, 200).await;
    assert_eq!(second.headers()["content-type"], "text/event-stream");
    let second = second.text().await.unwrap();

    assert_eq!(sse_text(&second), "Bonjour");
    assert_eq!(first, second);
    assert_eq!(chat_hits(&upstream, 1).await, 1);
    assert_eq!(relay.store.usage_logs().len(), 1);
}

#[tokio::test]
async fn test_different_request_misses_cache() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("ok", 10, 1)).await;
    let relay = cached_relay(&upstream, true).await;

    let mut other = chat_request("gpt-3.5-turbo", false);
    other["temperature"] = serde_json::json!(0.2);
    for body in [chat_request("gpt-3.5-turbo", false), other] {
        expect_status(relay.post_json("/v1/chat/completions", &body).await, 200).await;
    }

    assert_eq!(chat_hits(&upstream, 1).await, 2);
    assert_eq!(relay.store.usage_logs().len(), 2);
}

#[tokio::test]
async fn test_cache_disabled_always_relays() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("ok", 10, 1)).await;
    let relay = cached_relay(&upstream, false).await;

    for _ in 0..2 {
        let response = relay
            .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
            .await;
        expect_status(response, 200).await;
    }

    assert_eq!(chat_hits(&upstream, 1).await, 2);
    // ceil(10 * 0.75 + 1 * 1.0) twice
    assert_eq!(relay.quota(), 500_000 - 18);
}
