//! API surface tests: auth, error envelopes, models, metrics

use crate::fixtures::*;
use crate::helpers::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use wiremock::MockServer;

async fn relay(server: &MockServer) -> TestRelay {
    let channels = [
        ChannelSpec::openai(1, &server.uri()),
        ChannelSpec::anthropic(2, &server.uri()),
    ];
    TestRelay::from_yaml(&config_yaml(&channels, 0, false)).await
}

#[tokio::test]
async fn test_health_is_public() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    let response = expect_status(relay.get_anonymous("/health").await, 200).await;
    let body = TestRelay::json_body(response).await;

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["channels"], 2);
}

#[tokio::test]
async fn test_missing_key_gets_envelope_with_request_id() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    let response = relay
        .client
        .post(relay.url("/v1/chat/completions"))
        .header("x-request-id", "it-001")
        .json(&chat_request("gpt-3.5-turbo", false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
    assert_eq!(response.headers()["x-request-id"], "it-001");
    let body = TestRelay::json_body(response).await;
    assert_eq!(
        body,
        json!({"error": {
            "message": "No API key provided (request id: it-001)",
            "type": "authentication_error",
            "param": null,
            "code": "invalid_api_key"
        }})
    );
}

#[tokio::test]
async fn test_unknown_key_rejected() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    let response = relay
        .client
        .get(relay.url("/v1/models"))
        .bearer_auth("sk-unknown")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn test_models_sorted_by_owner_then_id() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    let response = expect_status(relay.get("/v1/models").await, 200).await;
    let body = TestRelay::json_body(response).await;
    let listed: Vec<(String, String)> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| {
            (
                m["owned_by"].as_str().unwrap().to_string(),
                m["id"].as_str().unwrap().to_string(),
            )
        })
        .collect();

    assert_eq!(
        listed,
        vec![
            ("anthropic".to_string(), "claude-3-haiku-20240307".to_string()),
            ("openai".to_string(), "gpt-3.5-turbo".to_string()),
            ("openai".to_string(), "gpt-4".to_string()),
            ("openai".to_string(), "text-embedding-ada-002".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_retrieve_model() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    let response = expect_status(relay.get("/v1/models/gpt-4").await, 200).await;
    let body = TestRelay::json_body(response).await;
    assert_eq!(body["id"], "gpt-4");
    assert_eq!(body["object"], "model");

    let response = expect_status(relay.get("/v1/models/gpt-5").await, 404).await;
    let body = TestRelay::json_body(response).await;
    assert_eq!(body["error"]["code"], "model_not_found");
}

#[tokio::test]
async fn test_validation_error_is_caller_error() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    let response = relay
        .post_json("/v1/chat/completions", &json!({"model": "gpt-3.5-turbo", "messages": []}))
        .await;

    let response = expect_status(response, 400).await;
    let body: Value = TestRelay::json_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(upstream.received_requests().await.unwrap().is_empty());
    assert_eq!(relay.quota(), 500_000);
}

#[tokio::test]
async fn test_unpriced_model_fails_closed() {
    let upstream = MockServer::start().await;
    let channels = [ChannelSpec::openai(1, &upstream.uri()).models(&["gpt-4o"])];
    let relay = TestRelay::from_yaml(&config_yaml(&channels, 0, false)).await;

    let response = relay.post_json("/v1/chat/completions", &chat_request("gpt-4o", false)).await;

    let response = expect_status(response, 503).await;
    let body = TestRelay::json_body(response).await;
    assert_eq!(body["error"]["code"], "pricing_not_found");
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let upstream = MockServer::start().await;
    let relay = relay(&upstream).await;

    expect_status(relay.get("/v1/models").await, 200).await;
    let response = expect_status(relay.get_anonymous("/metrics").await, 200).await;
    let text = response.text().await.unwrap();

    assert!(text.contains("relay_requests_total{endpoint=\"/v1/models\",status=\"200\"} 1"));
    assert!(text.contains("relay_request_duration_seconds"));
}
