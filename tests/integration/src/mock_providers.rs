//! Wiremock upstreams standing in for provider APIs

use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of an OpenAI endpoint on channel `id`
pub fn openai_path(id: i64, endpoint: &str) -> String {
    format!("/c{id}/v1/{endpoint}")
}

/// Channel `id` answers chat completions with `body`
pub async fn mount_openai_chat(server: &MockServer, id: i64, body: Value) {
    Mock::given(method("POST"))
        .and(path(openai_path(id, "chat/completions")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Channel `id` streams `sse` for chat completions
pub async fn mount_openai_stream(server: &MockServer, id: i64, sse: String) {
    Mock::given(method("POST"))
        .and(path(openai_path(id, "chat/completions")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(server)
        .await;
}

/// Channel `id` fails chat completions with `status` and `body`
pub async fn mount_openai_failure(server: &MockServer, id: i64, status: u16, body: Value) {
    Mock::given(method("POST"))
        .and(path(openai_path(id, "chat/completions")))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

/// Chat requests channel `id` received
pub async fn chat_hits(server: &MockServer, id: i64) -> usize {
    let wanted = openai_path(id, "chat/completions");
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .count()
}

/// Channel `id` answers the Messages API with `body`
pub async fn mount_anthropic_message(server: &MockServer, id: i64, body: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/c{id}/v1/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Channel `id` streams `sse` from the Messages API
pub async fn mount_anthropic_stream(server: &MockServer, id: i64, sse: String) {
    Mock::given(method("POST"))
        .and(path(format!("/c{id}/v1/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .mount(server)
        .await;
}
