//! Provider translation through the full relay

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use pretty_assertions::assert_eq;
use relay_core::ChannelStatus;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_anthropic_chat_translated() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/c1/v1/messages"))
        .and(header("x-api-key", "sk-upstream-1"))
        .and(body_partial_json(json!({
            "model": "claude-3-haiku-20240307",
            "system": "You are a helpful assistant.",
            "messages": [{"role": "user"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message("Paris.", 24, 4)))
        .expect(1)
        .mount(&upstream)
        .await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::anthropic(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("claude-3-haiku-20240307", false))
        .await;
    let body = TestRelay::json_body(expect_status(response, 200).await).await;

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Paris.");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 24);
    assert_eq!(body["usage"]["completion_tokens"], 4);
    // ceil(24 * 0.125 + 4 * 0.625)
    assert_eq!(relay.quota(), 500_000 - 6);
}

#[tokio::test]
async fn test_anthropic_stream_translated() {
    let upstream = MockServer::start().await;
    mount_anthropic_stream(&upstream, 1, anthropic_sse(&["Hello", " world"], 20, 4)).await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::anthropic(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("claude-3-haiku-20240307", true))
        .await;
    let body = expect_status(response, 200).await.text().await.unwrap();

    assert_eq!(sse_text(&body), "Hello world");
    let frames = sse_frames(&body);
    assert!(frames.iter().all(|f| f["object"] == "chat.completion.chunk"));
    assert!(frames
        .iter()
        .any(|f| f["choices"][0]["finish_reason"] == "stop"));
    assert!(body.ends_with("data: [DONE]\n\n"));

    // ceil(20 * 0.125 + 4 * 0.625)
    assert_eq!(relay.quota(), 500_000 - 5);
    let logs = relay.store.usage_logs();
    assert_eq!((logs[0].prompt_tokens, logs[0].completion_tokens), (20, 4));
}

#[tokio::test]
async fn test_model_mapping_rewrites_upstream_model_only() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/c1/v1/messages"))
        .and(body_partial_json(json!({"model": "claude-3-haiku-20240307"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message("ok", 20, 5)))
        .expect(1)
        .mount(&upstream)
        .await;
    let channels = [ChannelSpec::anthropic(1, &upstream.uri()).map("gpt-3.5-turbo", "claude-3-haiku-20240307")];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    let body = TestRelay::json_body(expect_status(response, 200).await).await;
    assert_eq!(body["model"], "gpt-3.5-turbo");

    // Billed at the caller-facing model's price: ceil(20 * 0.75 + 5 * 1.0)
    assert_eq!(relay.quota(), 500_000 - 20);
    let logs = relay.store.usage_logs();
    assert_eq!(logs[0].model, "gpt-3.5-turbo");
}

#[tokio::test]
async fn test_anthropic_auth_error_normalized() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/c1/v1/messages"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "invalid x-api-key"}
        })))
        .mount(&upstream)
        .await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::anthropic(1, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("claude-3-haiku-20240307", false))
        .await;

    let response = expect_status(response, 401).await;
    let body = TestRelay::json_body(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("invalid x-api-key"));
    assert_eq!(body["error"]["type"], "authentication_error");
    assert_eq!(relay.store.channel_status(1), Some(ChannelStatus::AutoDisabled));
    assert_eq!(relay.quota(), 500_000);
}

#[tokio::test]
async fn test_openai_upstream_receives_channel_key() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(openai_path(7, "chat/completions")))
        .and(header("authorization", "Bearer sk-upstream-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_chat_response("ok", 10, 1)))
        .expect(1)
        .mount(&upstream)
        .await;
    let relay = TestRelay::from_yaml(&config_yaml(&[ChannelSpec::openai(7, &upstream.uri())], 0, false)).await;

    let response = relay
        .post_json("/v1/chat/completions", &chat_request("gpt-3.5-turbo", false))
        .await;
    expect_status(response, 200).await;
}
