//! Channel selection, failover and auto-disable against live upstreams

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use pretty_assertions::assert_eq;
use relay_core::{Channel, ChannelStatus, ProviderType};
use relay_engine::SATURATED_MESSAGE;
use wiremock::MockServer;

#[tokio::test]
async fn test_highest_priority_channel_serves() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("low", 10, 1)).await;
    mount_openai_chat(&upstream, 2, openai_chat_response("high", 10, 1)).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()),
        ChannelSpec::openai(2, &upstream.uri()).priority(10),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 0, false)).await;

    for _ in 0..3 {
        let response = relay
            .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
            .await;
        let body = TestRelay::json_body(expect_status(response, 200).await).await;
        assert_eq!(body["choices"][0]["message"]["content"], "high");
    }
    assert_eq!(chat_hits(&upstream, 1).await, 0);
    assert_eq!(chat_hits(&upstream, 2).await, 3);
}

#[tokio::test]
async fn test_server_error_fails_over() {
    let upstream = MockServer::start().await;
    mount_openai_failure(&upstream, 1, 500, openai_error("boom", "server_error", "internal")).await;
    mount_openai_chat(&upstream, 2, openai_chat_response("from two", 10, 2)).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()).priority(10),
        ChannelSpec::openai(2, &upstream.uri()),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 1, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    let body = TestRelay::json_body(expect_status(response, 200).await).await;

    assert_eq!(body["choices"][0]["message"]["content"], "from two");
    assert_eq!(chat_hits(&upstream, 1).await, 1);
    assert_eq!(chat_hits(&upstream, 2).await, 1);

    // Quota was reserved once and settled against the channel that answered.
    let logs = relay.store.usage_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, 2);
    assert_eq!(relay.quota(), 500_000 - 10);
    assert_eq!(relay.store.channel_status(1), Some(ChannelStatus::Enabled));
}

#[tokio::test]
async fn test_exhausted_retries_surface_last_error() {
    let upstream = MockServer::start().await;
    mount_openai_failure(&upstream, 1, 502, openai_error("bad gateway", "server_error", "")).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 3, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;

    // The only channel is cooling down after its failure, so there is nothing left to try.
    let response = expect_status(response, 502).await;
    let body = TestRelay::json_body(response).await;
    assert!(body["error"]["message"].as_str().unwrap().starts_with("bad gateway"));
    assert_eq!(chat_hits(&upstream, 1).await, 1);
    assert_eq!(relay.quota(), 500_000);
}

#[tokio::test]
async fn test_invalid_upstream_key_disables_channel() {
    let upstream = MockServer::start().await;
    mount_openai_failure(
        &upstream,
        1,
        401,
        openai_error("Incorrect API key provided", "invalid_request_error", "invalid_api_key"),
    )
    .await;
    mount_openai_chat(&upstream, 2, openai_chat_response("ok", 10, 1)).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()).priority(10),
        ChannelSpec::openai(2, &upstream.uri()),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 1, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    expect_status(response, 200).await;
    assert_eq!(relay.store.channel_status(1), Some(ChannelStatus::AutoDisabled));

    // Later requests go straight to the healthy channel.
    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    expect_status(response, 200).await;
    assert_eq!(chat_hits(&upstream, 1).await, 1);
    assert_eq!(chat_hits(&upstream, 2).await, 2);
}

#[tokio::test]
async fn test_rate_limited_everywhere_reports_saturation() {
    let upstream = MockServer::start().await;
    let limited = openai_error("Rate limit reached for requests", "requests", "rate_limit_exceeded");
    mount_openai_failure(&upstream, 1, 429, limited.clone()).await;
    mount_openai_failure(&upstream, 2, 429, limited).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()),
        ChannelSpec::openai(2, &upstream.uri()),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 1, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;

    let response = expect_status(response, 429).await;
    let body = TestRelay::json_body(response).await;
    assert!(body["error"]["message"].as_str().unwrap().starts_with(SATURATED_MESSAGE));
    assert_eq!(chat_hits(&upstream, 1).await + chat_hits(&upstream, 2).await, 2);
    // Rate limiting never disables a channel.
    assert_eq!(relay.store.channel_status(1), Some(ChannelStatus::Enabled));
    assert_eq!(relay.store.channel_status(2), Some(ChannelStatus::Enabled));
}

#[tokio::test]
async fn test_pinned_channel_does_not_fail_over() {
    let upstream = MockServer::start().await;
    let limited = openai_error("Rate limit reached for requests", "requests", "rate_limit_exceeded");
    mount_openai_failure(&upstream, 1, 429, limited).await;
    mount_openai_chat(&upstream, 2, openai_chat_response("ok", 10, 1)).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()),
        ChannelSpec::openai(2, &upstream.uri()),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 3, false)).await;

    let response = relay
        .post_json_with_headers(
            "/v1/chat/completions",
            &chat_request("gpt-3.5-turbo", false),
            &[("x-relay-channel", "1")],
        )
        .await;

    let response = expect_status(response, 429).await;
    let body = TestRelay::json_body(response).await;
    // Pinned callers see the upstream's own message.
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Rate limit reached for requests"));
    assert_eq!(chat_hits(&upstream, 1).await, 1);
    assert_eq!(chat_hits(&upstream, 2).await, 0);
}

#[tokio::test]
async fn test_bad_request_is_terminal() {
    let upstream = MockServer::start().await;
    mount_openai_failure(
        &upstream,
        1,
        400,
        openai_error("max_tokens is too large", "invalid_request_error", "invalid_value"),
    )
    .await;
    mount_openai_chat(&upstream, 2, openai_chat_response("ok", 10, 1)).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()).priority(10),
        ChannelSpec::openai(2, &upstream.uri()),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 3, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;

    let response = expect_status(response, 400).await;
    let body = TestRelay::json_body(response).await;
    assert_eq!(body["error"]["code"], "invalid_value");
    assert_eq!(chat_hits(&upstream, 2).await, 0);
    assert_eq!(relay.quota(), 500_000);
}

#[tokio::test]
async fn test_disabled_channels_are_skipped() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 2, openai_chat_response("ok", 10, 1)).await;
    let channels = [
        ChannelSpec::openai(1, &upstream.uri()).priority(10).status("auto_disabled"),
        ChannelSpec::openai(2, &upstream.uri()),
    ];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    expect_status(response, 200).await;
    assert_eq!(chat_hits(&upstream, 1).await, 0);
}

#[tokio::test]
async fn test_unserved_model_has_no_channel() {
    let upstream = MockServer::start().await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("claude-3-haiku-20240307", false))
        .await;

    let response = expect_status(response, 503).await;
    let body = TestRelay::json_body(response).await;
    assert_eq!(body["error"]["code"], "no_channel_configured");
}

#[tokio::test]
async fn test_channel_added_after_boot_is_served() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 2, openai_chat_response("late", 10, 1)).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    relay.store.upsert_channel(
        Channel::new(2, "channel-2", ProviderType::OpenAI, "sk-upstream-2")
            .with_base_url(format!("{}/c2", upstream.uri()))
            .with_models(["claude-3-haiku-20240307"]),
    );

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("claude-3-haiku-20240307", false))
        .await;
    let body = TestRelay::json_body(expect_status(response, 200).await).await;
    assert_eq!(body["choices"][0]["message"]["content"], "late");
    assert_eq!(chat_hits(&upstream, 2).await, 1);
}
