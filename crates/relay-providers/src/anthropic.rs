//! Anthropic Claude adaptor (Messages API).
//!
//! The Claude request/response model and the stream event state machine are
//! shared with the Bedrock adaptor, which carries the same payloads inside AWS
//! event-stream frames.

use async_trait::async_trait;
use futures::StreamExt;
use http::{HeaderMap, HeaderValue, StatusCode};
use relay_core::{
    Adaptor, Channel, ChatCapability, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatMessage, ContentPart, EventStream, MessageContent, MessageRole,
    OpenAIError, ProviderType, RelayError, RelayResult, Usage,
};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::requester::{body_error, HttpRequester};

/// Anthropic API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory for Claude
pub const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Claude Messages API request
#[derive(Debug, Clone, Serialize)]
pub struct ClaudeRequest {
    /// Model ID (absent on Bedrock, where it is part of the URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Bedrock API version marker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_version: Option<&'static str>,
    /// Conversation, alternating user/assistant
    pub messages: Vec<ClaudeMessage>,
    /// System prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: i64,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Stream the response
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// Claude message
#[derive(Debug, Clone, Serialize)]
pub struct ClaudeMessage {
    /// `user` or `assistant`
    pub role: &'static str,
    /// Content blocks
    pub content: Vec<Value>,
}

impl ClaudeRequest {
    /// Convert an OpenAI-shaped chat request
    #[must_use]
    pub fn from_chat(request: &ChatCompletionRequest) -> Self {
        let mut system = Vec::new();
        let mut messages: Vec<ClaudeMessage> = Vec::new();

        for message in &request.messages {
            let role = match message.role {
                MessageRole::System | MessageRole::Developer => {
                    system.push(message.text_content());
                    continue;
                }
                MessageRole::Assistant => "assistant",
                MessageRole::User | MessageRole::Tool | MessageRole::Function => "user",
            };

            let blocks = content_blocks(message);
            if blocks.is_empty() {
                continue;
            }
            // Claude rejects two consecutive turns from the same role
            match messages.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => messages.push(ClaudeMessage {
                    role,
                    content: blocks,
                }),
            }
        }

        Self {
            model: Some(request.model.clone()),
            anthropic_version: None,
            messages,
            system: (!system.is_empty()).then(|| system.join("\n")),
            max_tokens: request
                .max_tokens
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: stop_sequences(request.stop.as_ref()),
            stream: request.stream,
        }
    }
}

fn content_blocks(message: &ChatMessage) -> Vec<Value> {
    match &message.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => {
            vec![json!({"type": "text", "text": text})]
        }
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::ImageUrl { image_url } => image_block(image_url),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn image_block(image_url: &Value) -> Option<Value> {
    let url = image_url
        .get("url")
        .and_then(Value::as_str)
        .or_else(|| image_url.as_str())?;

    if let Some(rest) = url.strip_prefix("data:") {
        let (media_type, data) = rest.split_once(";base64,")?;
        return Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data}
        }));
    }
    Some(json!({"type": "image", "source": {"type": "url", "url": url}}))
}

fn stop_sequences(stop: Option<&Value>) -> Vec<String> {
    match stop {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Map a Claude stop reason to an OpenAI finish reason
#[must_use]
pub fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

/// Claude token usage
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ClaudeUsage {
    /// Prompt tokens
    #[serde(default)]
    pub input_tokens: u32,
    /// Completion tokens
    #[serde(default)]
    pub output_tokens: u32,
}

/// Buffered Claude response
#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeResponse {
    /// Message ID
    #[serde(default)]
    pub id: String,
    /// Model
    #[serde(default)]
    pub model: String,
    /// Content blocks
    #[serde(default)]
    pub content: Vec<Value>,
    /// Stop reason
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Usage
    #[serde(default)]
    pub usage: ClaudeUsage,
    /// Inline error
    #[serde(default)]
    pub error: Option<ClaudeErrorBody>,
}

impl ClaudeResponse {
    /// Convert into an OpenAI chat completion for `model`
    pub fn into_chat(self, model: &str) -> RelayResult<ChatCompletionResponse> {
        if let Some(error) = self.error.filter(|e| !e.message.is_empty()) {
            return Err(body_error(error.into_openai()));
        }
        let text: String = self
            .content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();

        Ok(ChatCompletionResponse::single(
            self.id,
            model,
            text,
            self.stop_reason.as_deref().map(finish_reason),
            Usage::new(self.usage.input_tokens, self.usage.output_tokens),
        ))
    }
}

/// Claude error object
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeErrorBody {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: String,
    /// Message
    #[serde(default)]
    pub message: String,
}

impl ClaudeErrorBody {
    fn into_openai(self) -> OpenAIError {
        OpenAIError::new(self.message, self.error_type.clone(), self.error_type.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeErrorEnvelope {
    error: ClaudeErrorBody,
}

/// Decode Anthropic's `{"type":"error","error":{"type","message"}}`
pub fn claude_error(_status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    serde_json::from_slice::<ClaudeErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error.into_openai())
}

/// Claude stream event
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamEvent {
    /// First event, carries the prompt usage
    MessageStart {
        /// Message skeleton
        message: ClaudeStreamMessage,
    },
    /// Content block opened
    ContentBlockStart {
        /// Block
        #[serde(default)]
        content_block: Value,
    },
    /// Content delta
    ContentBlockDelta {
        /// Delta
        delta: Value,
    },
    /// Content block closed
    ContentBlockStop,
    /// Stop reason and completion usage
    MessageDelta {
        /// Delta
        #[serde(default)]
        delta: Value,
        /// Output usage
        #[serde(default)]
        usage: ClaudeUsage,
    },
    /// Last event
    MessageStop,
    /// Keep-alive
    Ping,
    /// In-stream error
    Error {
        /// Error
        error: ClaudeErrorBody,
    },
}

/// `message_start` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeStreamMessage {
    /// Message ID
    #[serde(default)]
    pub id: String,
    /// Usage so far
    #[serde(default)]
    pub usage: ClaudeUsage,
}

/// Turns Claude stream events into OpenAI chunks
#[derive(Debug, Clone)]
pub struct ClaudeStreamState {
    id: String,
    model: String,
    input_tokens: u32,
    finished: bool,
}

impl ClaudeStreamState {
    /// Start a stream answering for `model`
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            input_tokens: 0,
            finished: false,
        }
    }

    /// Whether `message_stop` was seen
    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feed one event; returns the chunk to forward, if any
    pub fn on_event(&mut self, event: ClaudeStreamEvent) -> RelayResult<Option<ChatCompletionChunk>> {
        match event {
            ClaudeStreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id;
                }
                self.input_tokens = message.usage.input_tokens;
                Ok(None)
            }
            ClaudeStreamEvent::ContentBlockStart { content_block } => Ok(content_block
                .get("text")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(|text| ChatCompletionChunk::delta(&self.id, &self.model, text, None))),
            ClaudeStreamEvent::ContentBlockDelta { delta } => Ok(delta
                .get("text")
                .and_then(Value::as_str)
                .map(|text| ChatCompletionChunk::delta(&self.id, &self.model, text, None))),
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                let reason = delta
                    .get("stop_reason")
                    .and_then(Value::as_str)
                    .map(finish_reason);
                let mut chunk = ChatCompletionChunk::delta(&self.id, &self.model, "", reason);
                chunk.usage = Some(Usage::new(self.input_tokens, usage.output_tokens));
                Ok(Some(chunk))
            }
            ClaudeStreamEvent::MessageStop => {
                self.finished = true;
                Ok(None)
            }
            ClaudeStreamEvent::ContentBlockStop | ClaudeStreamEvent::Ping => Ok(None),
            ClaudeStreamEvent::Error { error } => Err(body_error(error.into_openai())),
        }
    }
}

/// Adaptor for the Anthropic Messages API
pub struct AnthropicAdaptor {
    channel: Channel,
    api_key: SecretString,
    requester: Arc<HttpRequester>,
}

impl AnthropicAdaptor {
    /// Create an adaptor for `channel`
    #[must_use]
    pub fn new(channel: Channel, api_key: SecretString, requester: Arc<HttpRequester>) -> Self {
        Self {
            channel,
            api_key,
            requester,
        }
    }

    fn client(&self) -> RelayResult<Client> {
        self.requester.client(self.channel.proxy.as_deref())
    }

    async fn post(&self, body: &ClaudeRequest) -> RelayResult<reqwest::RequestBuilder> {
        let model = body.model.as_deref().unwrap_or_default();
        let url = self.full_request_url("/v1/messages", model).await?;
        let mut headers = HeaderMap::new();
        self.request_headers(&mut headers).await?;
        debug!(channel_id = self.channel.id, url = %url, "Dispatching Claude request");
        Ok(self.client()?.post(url).headers(headers).json(body))
    }
}

impl std::fmt::Debug for AnthropicAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdaptor")
            .field("channel_id", &self.channel.id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()> {
        let key = HeaderValue::from_str(self.api_key.expose_secret())
            .map_err(|_| RelayError::channel_config("channel key contains invalid header characters"))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(())
    }

    async fn full_request_url(&self, _path: &str, _model: &str) -> RelayResult<String> {
        Ok(format!("{}/v1/messages", self.channel.base_url()))
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        claude_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapability for AnthropicAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let mut body = ClaudeRequest::from_chat(request);
        body.stream = false;

        let response: ClaudeResponse = self
            .requester
            .send_json(self.post(&body).await?, claude_error)
            .await?;
        response.into_chat(&request.model)
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let mut body = ClaudeRequest::from_chat(request);
        body.stream = true;

        let lines = self
            .requester
            .sse_lines(self.post(&body).await?, claude_error)
            .await?;
        let mut state = ClaudeStreamState::new(request.model.clone());

        Ok(EventStream::spawn(async_stream::try_stream! {
            let mut lines = Box::pin(lines);
            while let Some(line) = lines.next().await {
                let line = line?;
                let event = match serde_json::from_str::<ClaudeStreamEvent>(&line) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, data = %line, "Skipping unrecognized Claude event");
                        continue;
                    }
                };
                if let Some(chunk) = state.on_event(event)? {
                    yield chunk;
                }
                if state.finished() {
                    break;
                }
            }
        }))
    }
}
