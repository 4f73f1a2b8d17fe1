//! End-to-end relay flows: buffered, streamed and billed

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use pretty_assertions::assert_eq;
use relay_config::load_config_from;
use relay_core::User;
use serde_json::json;
use std::io::Write;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_e2e_chat_completion_billed() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("Paris.", 20, 5)).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    let response = expect_status(response, 200).await;
    let body = TestRelay::json_body(response).await;

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Paris.");
    assert_eq!(body["usage"]["total_tokens"], 25);

    // ceil(20 * 0.75 + 5 * 1.0)
    assert_eq!(relay.quota(), 500_000 - 20);
    let logs = relay.store.usage_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, 1);
    assert_eq!(logs[0].model, "gpt-3.5-turbo");
    assert_eq!((logs[0].prompt_tokens, logs[0].completion_tokens), (20, 5));
    assert_eq!(logs[0].quota, 20);
    assert!(!logs[0].is_stream);
    assert_eq!(relay.store.channel_used_quota(1), 20);
    assert_eq!(relay.user_quota(), 10_000_000 - 20);
}

#[tokio::test]
async fn test_e2e_user_quota_shortfall_is_forbidden() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("Paris.", 20, 5)).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;
    relay.store.upsert_user(User { id: 1, quota: 1 });

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;

    let body = TestRelay::json_body(expect_status(response, 403).await).await;
    assert_eq!(body["error"]["code"], "insufficient_user_quota");
    assert_eq!(chat_hits(&upstream, 1).await, 0);
    assert_eq!(relay.quota(), 500_000);
    assert_eq!(relay.user_quota(), 1);
}

#[tokio::test]
async fn test_e2e_stream_relayed_and_settled() {
    let upstream = MockServer::start().await;
    let sse = openai_sse(&[
        openai_chunk("Paris"),
        openai_chunk(" is"),
        openai_chunk(" the capital"),
        openai_usage_chunk(20, 3),
    ]);
    mount_openai_stream(&upstream, 1, sse).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", true))
        .await;
    let response = expect_status(response, 200).await;
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let body = response.text().await.unwrap();

    assert_eq!(sse_text(&body), "Paris is the capital");
    assert!(body.ends_with("data: [DONE]\n\n"));
    // The caller did not ask for usage, so the usage-only chunk is not forwarded.
    assert!(sse_frames(&body).iter().all(|f| f.get("usage").map_or(true, |u| u.is_null())));

    // ceil(20 * 0.75 + 3 * 1.0)
    assert_eq!(relay.quota(), 500_000 - 18);
    let logs = relay.store.usage_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_stream);
}

#[tokio::test]
async fn test_e2e_stream_include_usage() {
    let upstream = MockServer::start().await;
    let sse = openai_sse(&[openai_chunk("Hi"), openai_usage_chunk(12, 1)]);
    mount_openai_stream(&upstream, 1, sse).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    let mut request = chat_request("gpt-3.5-turbo", true);
    request["stream_options"] = json!({"include_usage": true});
    let response = expect_status(relay.post_json("/v1/chat/completions", &request).await, 200).await;
    let body = response.text().await.unwrap();

    let frames = sse_frames(&body);
    let last = frames.last().unwrap();
    assert_eq!(last["choices"], json!([]));
    assert_eq!(last["usage"]["prompt_tokens"], 12);
    assert_eq!(last["usage"]["completion_tokens"], 1);
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_e2e_stream_options_without_stream_rejected() {
    let upstream = MockServer::start().await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    let mut request = chat_request("gpt-3.5-turbo", false);
    request["stream_options"] = json!({"include_usage": true});
    expect_status(relay.post_json("/v1/chat/completions", &request).await, 400).await;
}

#[tokio::test]
async fn test_e2e_embeddings_with_wildcard_price() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(openai_path(1, "embeddings")))
        .and(body_partial_json(json!({"model": "text-embedding-ada-002"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{"object": "embedding", "index": 0, "embedding": [0.25, -0.5]}],
            "model": "text-embedding-ada-002",
            "usage": {"prompt_tokens": 40, "total_tokens": 40}
        })))
        .expect(1)
        .mount(&upstream)
        .await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json(
            "/v1/embeddings",
            &json!({"model": "text-embedding-ada-002", "input": "The food was delicious"}),
        )
        .await;
    let body = TestRelay::json_body(expect_status(response, 200).await).await;

    assert_eq!(body["data"][0]["embedding"], json!([0.25, -0.5]));
    // ceil(40 * 0.05)
    assert_eq!(relay.quota(), 500_000 - 2);
}

#[tokio::test]
async fn test_e2e_boot_from_config_file() {
    let upstream = MockServer::start().await;
    mount_openai_chat(&upstream, 1, openai_chat_response("ok", 10, 2)).await;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(config_yaml(&[ChannelSpec::openai(1, &upstream.uri())], 1, false).as_bytes())
        .unwrap();
    let config = load_config_from(file.path()).await.unwrap();
    assert_eq!(config.relay.retry_times, 1);

    let relay = TestRelay::start(config).await;
    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    expect_status(response, 200).await;
    assert_eq!(chat_hits(&upstream, 1).await, 1);
}
