//! Request types for every relayed endpoint family.
//!
//! Requests keep unknown top-level fields in `extra` so OpenAI-compatible
//! upstreams receive exactly what the caller sent, apart from the model name.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RelayError, RelayResult};

/// Upper bound accepted for `max_tokens`
pub const MAX_TOKENS_LIMIT: i64 = (i32::MAX / 2) as i64;

/// Chat completion request (OpenAI compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Target model
    pub model: String,

    /// Conversation
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Number of choices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    /// Stream the response as SSE
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,

    /// Streaming options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    /// Stop sequences (string or array)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,

    /// Presence penalty (-2.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Frequency penalty (-2.0 to 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    /// Tool definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,

    /// Tool choice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,

    /// Response format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,

    /// Seed for deterministic sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    /// End-user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `stream_options` object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Emit a final usage chunk before `[DONE]`
    #[serde(default)]
    pub include_usage: bool,
}

impl ChatCompletionRequest {
    /// Create a new builder
    #[must_use]
    pub fn builder() -> ChatCompletionRequestBuilder {
        ChatCompletionRequestBuilder::default()
    }

    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::validation(
                "model is required",
                Some("model".to_string()),
                "missing_model",
            ));
        }

        if self.messages.is_empty() {
            return Err(RelayError::validation(
                "messages cannot be empty",
                Some("messages".to_string()),
                "empty_messages",
            ));
        }

        validate_max_tokens(self.max_tokens)?;
        validate_stream_options(self.stream, self.stream_options.as_ref())?;

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RelayError::validation(
                    format!("temperature must be between 0.0 and 2.0, got {t}"),
                    Some("temperature".to_string()),
                    "invalid_temperature",
                ));
            }
        }

        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(RelayError::validation(
                    format!("top_p must be between 0.0 and 1.0, got {p}"),
                    Some("top_p".to_string()),
                    "invalid_top_p",
                ));
            }
        }

        if let Some(n) = self.n {
            if n == 0 || n > 128 {
                return Err(RelayError::validation(
                    format!("n must be between 1 and 128, got {n}"),
                    Some("n".to_string()),
                    "invalid_n",
                ));
            }
        }

        Ok(())
    }

    /// Whether the caller asked for a trailing usage chunk
    #[must_use]
    pub fn include_usage(&self) -> bool {
        self.stream && self.stream_options.is_some_and(|o| o.include_usage)
    }

    /// Whether the request carries tool definitions
    #[must_use]
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }
}

fn validate_max_tokens(max_tokens: Option<i64>) -> RelayResult<()> {
    if let Some(max) = max_tokens {
        if !(0..=MAX_TOKENS_LIMIT).contains(&max) {
            return Err(RelayError::validation(
                format!("max_tokens must be between 0 and {MAX_TOKENS_LIMIT}, got {max}"),
                Some("max_tokens".to_string()),
                "invalid_max_tokens",
            ));
        }
    }
    Ok(())
}

fn validate_stream_options(stream: bool, options: Option<&StreamOptions>) -> RelayResult<()> {
    if options.is_some() && !stream {
        return Err(RelayError::validation(
            "stream_options is only allowed when stream is true",
            Some("stream_options".to_string()),
            "invalid_stream_options",
        ));
    }
    Ok(())
}

fn require_model(model: &str) -> RelayResult<()> {
    if model.trim().is_empty() {
        return Err(RelayError::validation(
            "model is required",
            Some("model".to_string()),
            "missing_model",
        ));
    }
    Ok(())
}

/// Builder for `ChatCompletionRequest`
#[derive(Debug, Default)]
pub struct ChatCompletionRequestBuilder {
    model: Option<String>,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    max_tokens: Option<i64>,
    stream: bool,
    include_usage: bool,
    tools: Option<Vec<ToolDefinition>>,
}

impl ChatCompletionRequestBuilder {
    /// Set the model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add a message
    #[must_use]
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max_tokens
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Enable streaming
    #[must_use]
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Request a trailing usage chunk
    #[must_use]
    pub fn include_usage(mut self, include: bool) -> Self {
        self.include_usage = include;
        self
    }

    /// Set tools
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Build and validate the request
    pub fn build(self) -> RelayResult<ChatCompletionRequest> {
        let model = self.model.ok_or_else(|| {
            RelayError::validation("model is required", Some("model".to_string()), "missing_model")
        })?;

        let request = ChatCompletionRequest {
            model,
            messages: self.messages,
            temperature: self.temperature,
            top_p: None,
            n: None,
            max_tokens: self.max_tokens,
            stream: self.stream,
            stream_options: self
                .include_usage
                .then_some(StreamOptions { include_usage: true }),
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            tools: self.tools,
            tool_choice: None,
            response_format: None,
            seed: None,
            user: None,
            extra: Map::new(),
        };

        request.validate()?;
        Ok(request)
    }
}

/// Chat message with role and content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message author
    pub role: MessageRole,

    /// Content of the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    /// Optional name of the author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls made by the assistant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,

    /// Tool call ID for tool response messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, content)
    }

    /// Concatenated text of all text parts
    #[must_use]
    pub fn text_content(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message
    System,
    /// Developer message
    Developer,
    /// User message
    User,
    /// Assistant message
    Assistant,
    /// Tool response message
    Tool,
    /// Legacy function response message
    Function,
}

impl MessageRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Function => "function",
        }
    }
}

/// Message content (text or multimodal parts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content
    Text(String),
    /// Multimodal content parts
    Parts(Vec<ContentPart>),
}

/// Content part for multimodal messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content part
    Text {
        /// The text content
        text: String,
    },
    /// Image content part
    ImageUrl {
        /// Image URL details
        image_url: Value,
    },
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool type (usually "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function definition
    pub function: Value,
}

/// Legacy text completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Target model
    pub model: String,
    /// Prompt (string or array)
    #[serde(default)]
    pub prompt: Value,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    /// Stream the response as SSE
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    /// Streaming options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionRequest {
    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        require_model(&self.model)?;
        validate_max_tokens(self.max_tokens)?;
        validate_stream_options(self.stream, self.stream_options.as_ref())
    }

    /// Whether the caller asked for a trailing usage chunk
    #[must_use]
    pub fn include_usage(&self) -> bool {
        self.stream && self.stream_options.is_some_and(|o| o.include_usage)
    }

    /// Prompt flattened to text
    #[must_use]
    pub fn prompt_text(&self) -> String {
        value_text(&self.prompt)
    }
}

/// Embedding request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Target model
    #[serde(default)]
    pub model: String,
    /// Input (string, array of strings, or token arrays)
    pub input: Value,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EmbeddingRequest {
    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        require_model(&self.model)?;
        if value_text(&self.input).is_empty() && !self.input.is_array() {
            return Err(RelayError::validation(
                "input is required",
                Some("input".to_string()),
                "missing_input",
            ));
        }
        Ok(())
    }

    /// Input flattened to text
    #[must_use]
    pub fn input_text(&self) -> String {
        value_text(&self.input)
    }
}

/// Moderation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRequest {
    /// Target model
    #[serde(default = "default_moderation_model")]
    pub model: String,
    /// Input (string or array)
    pub input: Value,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_moderation_model() -> String {
    "text-moderation-latest".to_string()
}

impl ModerationRequest {
    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        require_model(&self.model)
    }

    /// Input flattened to text
    #[must_use]
    pub fn input_text(&self) -> String {
        value_text(&self.input)
    }
}

/// Text-to-speech request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    /// Target model
    pub model: String,
    /// Text to synthesize
    pub input: String,
    /// Voice
    pub voice: String,
    /// Output format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    /// Playback speed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl SpeechRequest {
    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        require_model(&self.model)?;
        if self.input.is_empty() {
            return Err(RelayError::validation(
                "input is required",
                Some("input".to_string()),
                "missing_input",
            ));
        }
        if self.voice.is_empty() {
            return Err(RelayError::validation(
                "voice is required",
                Some("voice".to_string()),
                "missing_voice",
            ));
        }
        Ok(())
    }
}

/// Uploaded file from a multipart request
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// Original filename
    pub filename: String,
    /// MIME type
    pub content_type: Option<String>,
    /// File bytes
    pub data: Bytes,
}

/// Transcription or translation request (multipart)
#[derive(Debug, Clone)]
pub struct AudioRequest {
    /// Target model
    pub model: String,
    /// Audio file
    pub file: FileUpload,
    /// Remaining text form fields, forwarded as-is
    pub fields: Vec<(String, String)>,
}

impl AudioRequest {
    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        require_model(&self.model)?;
        if self.file.data.is_empty() {
            return Err(RelayError::validation(
                "file is required",
                Some("file".to_string()),
                "missing_file",
            ));
        }
        Ok(())
    }

    /// Value of a forwarded form field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Image generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Target model
    #[serde(default = "default_image_model")]
    pub model: String,
    /// Prompt
    pub prompt: String,
    /// Number of images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    /// Image size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// `url` or `b64_json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_image_model() -> String {
    "dall-e-2".to_string()
}

impl ImageRequest {
    /// Validate the request
    pub fn validate(&self) -> RelayResult<()> {
        require_model(&self.model)?;
        if self.prompt.is_empty() {
            return Err(RelayError::validation(
                "prompt is required",
                Some("prompt".to_string()),
                "missing_prompt",
            ));
        }
        if let Some(n) = self.n {
            if n == 0 || n > 10 {
                return Err(RelayError::validation(
                    format!("n must be between 1 and 10, got {n}"),
                    Some("n".to_string()),
                    "invalid_n",
                ));
            }
        }
        Ok(())
    }

    /// Number of images requested
    #[must_use]
    pub fn count(&self) -> u32 {
        self.n.unwrap_or(1)
    }

    /// Whether the caller asked for hosted URLs
    #[must_use]
    pub fn wants_url(&self) -> bool {
        self.response_format.as_deref().map_or(true, |f| f == "url")
    }
}

/// Image edit or variation request (multipart)
#[derive(Debug, Clone)]
pub struct ImageEditRequest {
    /// Target model
    pub model: String,
    /// Source image
    pub image: FileUpload,
    /// Optional mask (edits only)
    pub mask: Option<FileUpload>,
    /// Prompt (edits only)
    pub prompt: Option<String>,
    /// Remaining text form fields, forwarded as-is
    pub fields: Vec<(String, String)>,
}

impl ImageEditRequest {
    /// Validate the request; `needs_prompt` is true for edits
    pub fn validate(&self, needs_prompt: bool) -> RelayResult<()> {
        require_model(&self.model)?;
        if self.image.data.is_empty() {
            return Err(RelayError::validation(
                "image is required",
                Some("image".to_string()),
                "missing_image",
            ));
        }
        if needs_prompt && self.prompt.as_deref().map_or(true, str::is_empty) {
            return Err(RelayError::validation(
                "prompt is required",
                Some("prompt".to_string()),
                "missing_prompt",
            ));
        }
        Ok(())
    }

    /// Number of images requested
    #[must_use]
    pub fn count(&self) -> u32 {
        self.fields
            .iter()
            .find(|(k, _)| k == "n")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(1)
    }
}

/// Flatten a string / array-of-strings JSON value into text
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ChatCompletionRequest::builder()
            .model("gpt-4")
            .message(ChatMessage::user("Hello"))
            .temperature(0.7)
            .max_tokens(100)
            .build()
            .expect("should build");

        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.max_tokens, Some(100));
    }

    #[test]
    fn test_max_tokens_bounds() {
        let result = ChatCompletionRequest::builder()
            .model("gpt-4")
            .message(ChatMessage::user("Hello"))
            .max_tokens(-1)
            .build();
        assert!(result.is_err());

        let result = ChatCompletionRequest::builder()
            .model("gpt-4")
            .message(ChatMessage::user("Hello"))
            .max_tokens(MAX_TOKENS_LIMIT + 1)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_stream_options_require_stream() {
        let request: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "stream_options": {"include_usage": true}
        }))
        .expect("parse");

        let err = request.validate().unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_unknown_fields_roundtrip() {
        let raw = serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"50256": -100},
            "parallel_tool_calls": false
        });
        let request: ChatCompletionRequest = serde_json::from_value(raw).expect("parse");
        let back = serde_json::to_value(&request).expect("serialize");

        assert_eq!(back["logit_bias"]["50256"], -100);
        assert_eq!(back["parallel_tool_calls"], false);
        assert!(back.get("stream").is_none());
    }

    #[test]
    fn test_multimodal_text_content() {
        let message: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "describe"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]
        }))
        .expect("parse");

        assert_eq!(message.text_content(), "describe");
    }

    #[test]
    fn test_embedding_defaults() {
        let request: EmbeddingRequest =
            serde_json::from_value(serde_json::json!({"input": ["a", "b"]})).expect("parse");
        assert!(request.validate().is_err());
        assert_eq!(request.input_text(), "a\nb");
    }
}
