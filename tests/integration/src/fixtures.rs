//! Config, request and upstream payload fixtures

use serde_json::{json, Value};

/// Prices, the test user and its token shared by every config
const BILLING_AND_TOKENS: &str = r#"
billing:
  group_ratios:
    vip: 0.5
  prices:
    - model: gpt-3.5-turbo
      input: 0.75
      output: 1.0
      owned_by: openai
    - model: gpt-4
      input: 15
      output: 30
      owned_by: openai
    - model: claude-3-haiku-20240307
      input: 0.125
      output: 0.625
      owned_by: anthropic
    - model: text-embedding-*
      input: 0.05
      owned_by: openai
users:
  - id: 1
    quota: 10000000
tokens:
  - id: 1
    user_id: 1
    name: default
    key: sk-relay-test
    remain_quota: 500000
    chat_cache: true
    allow_channel_pin: true
"#;

/// Channel entry of a fixture config
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    id: i64,
    provider: &'static str,
    base_url: String,
    models: Vec<&'static str>,
    priority: i64,
    mapping: Vec<(&'static str, &'static str)>,
    status: Option<&'static str>,
}

impl ChannelSpec {
    /// OpenAI channel `id` served under `{uri}/c{id}`
    pub fn openai(id: i64, uri: &str) -> Self {
        Self::new(id, "openai", uri)
    }

    /// Anthropic channel `id` served under `{uri}/c{id}`
    pub fn anthropic(id: i64, uri: &str) -> Self {
        Self::new(id, "anthropic", uri).models(&["claude-3-haiku-20240307", "gpt-3.5-turbo"])
    }

    fn new(id: i64, provider: &'static str, uri: &str) -> Self {
        Self {
            id,
            provider,
            base_url: format!("{uri}/c{id}"),
            models: vec!["gpt-3.5-turbo", "gpt-4", "text-embedding-ada-002"],
            priority: 0,
            mapping: Vec::new(),
            status: None,
        }
    }

    /// Replace the served models
    pub fn models(mut self, models: &[&'static str]) -> Self {
        self.models = models.to_vec();
        self
    }

    /// Set the priority tier
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Add a model mapping entry
    pub fn map(mut self, from: &'static str, to: &'static str) -> Self {
        self.mapping.push((from, to));
        self
    }

    /// Set the initial status (`enabled`, `auto_disabled`, `manually_disabled`)
    pub fn status(mut self, status: &'static str) -> Self {
        self.status = Some(status);
        self
    }

    fn to_yaml(&self) -> String {
        let mut yaml = format!(
            "  - id: {id}\n    name: channel-{id}\n    provider: {provider}\n    key: sk-upstream-{id}\n    base_url: {base}\n    models: [{models}]\n    priority: {priority}\n",
            id = self.id,
            provider = self.provider,
            base = self.base_url,
            models = self.models.join(", "),
            priority = self.priority,
        );
        if !self.mapping.is_empty() {
            yaml.push_str("    model_mapping:\n");
            for (from, to) in &self.mapping {
                yaml.push_str(&format!("      {from}: {to}\n"));
            }
        }
        if let Some(status) = self.status {
            yaml.push_str(&format!("    status: {status}\n"));
        }
        yaml
    }
}

/// Full YAML config for `channels` with a retry budget and optional cache
pub fn config_yaml(channels: &[ChannelSpec], retry_times: u32, cache: bool) -> String {
    let mut yaml = format!(
        "relay:\n  retry_times: {retry_times}\n  retry_cooldown: 60s\n  request_timeout: 10s\ncache:\n  enabled: {cache}\n  ttl: 5m\n"
    );
    yaml.push_str(BILLING_AND_TOKENS);
    yaml.push_str("channels:\n");
    for channel in channels {
        yaml.push_str(&channel.to_yaml());
    }
    yaml
}

/// Chat request body
pub fn chat_request(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "What is the capital of France?"}
        ],
        "stream": stream
    })
}

/// OpenAI chat completion body
pub fn openai_chat_response(content: &str, prompt_tokens: u32, completion_tokens: u32) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

/// OpenAI stream chunk with a content delta
pub fn openai_chunk(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "gpt-3.5-turbo",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
}

/// OpenAI usage-only chunk
pub fn openai_usage_chunk(prompt_tokens: u32, completion_tokens: u32) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "gpt-3.5-turbo",
        "choices": [],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

/// OpenAI SSE body terminated by `[DONE]`
pub fn openai_sse(events: &[Value]) -> String {
    let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

/// OpenAI error envelope
pub fn openai_error(message: &str, error_type: &str, code: &str) -> Value {
    json!({"error": {"message": message, "type": error_type, "param": null, "code": code}})
}

/// Anthropic Messages API response
pub fn anthropic_message(text: &str, input_tokens: u32, output_tokens: u32) -> Value {
    json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "model": "claude-3-haiku-20240307",
        "stop_reason": "end_turn",
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens}
    })
}

/// Anthropic SSE body streaming `parts`
pub fn anthropic_sse(parts: &[&str], input_tokens: u32, output_tokens: u32) -> String {
    let mut events = vec![json!({
        "type": "message_start",
        "message": {"id": "msg_test", "usage": {"input_tokens": input_tokens}}
    })];
    for part in parts {
        events.push(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": part}
        }));
    }
    events.push(json!({
        "type": "message_delta",
        "delta": {"stop_reason": "end_turn"},
        "usage": {"output_tokens": output_tokens}
    }));
    events.push(json!({"type": "message_stop"}));

    events
        .iter()
        .map(|e| format!("event: {}\ndata: {e}\n\n", e["type"].as_str().unwrap_or_default()))
        .collect()
}

/// Concatenated `delta.content` of every JSON frame in an SSE body
pub fn sse_text(body: &str) -> String {
    sse_frames(body)
        .iter()
        .filter_map(|frame| frame["choices"][0]["delta"]["content"].as_str().map(ToString::to_string))
        .collect()
}

/// JSON frames of an SSE body, excluding `[DONE]`
pub fn sse_frames(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}
