//! Response types for every relayed endpoint family.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens in the completion
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Create usage with a computed total
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Response ID
    #[serde(default)]
    pub id: String,
    /// Object type
    #[serde(default = "chat_completion_object")]
    pub object: String,
    /// Creation timestamp
    #[serde(default)]
    pub created: i64,
    /// Model that produced the response
    #[serde(default)]
    pub model: String,
    /// Choices
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn chat_completion_object() -> String {
    "chat.completion".to_string()
}

impl ChatCompletionResponse {
    /// Build a single-choice assistant response
    #[must_use]
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        finish_reason: Option<String>,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.into(),
            object: chat_completion_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage::assistant(content),
                finish_reason,
                extra: Map::new(),
            }],
            usage: Some(usage),
            extra: Map::new(),
        }
    }

    /// Concatenated text of all choices
    #[must_use]
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.message.content.as_deref())
            .collect()
    }
}

/// Completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Index
    #[serde(default)]
    pub index: u32,
    /// Message
    pub message: ResponseMessage,
    /// Finish reason
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Fields the relay does not interpret (e.g. logprobs)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Assistant message in a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Role
    #[serde(default = "assistant_role")]
    pub role: String,
    /// Content
    #[serde(default)]
    pub content: Option<String>,
    /// Fields the relay does not interpret (e.g. tool_calls)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

impl ResponseMessage {
    /// Assistant message with text content
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: assistant_role(),
            content: Some(content.into()),
            extra: Map::new(),
        }
    }
}

/// Streaming chat chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Chunk ID
    #[serde(default)]
    pub id: String,
    /// Object type
    #[serde(default = "chunk_object")]
    pub object: String,
    /// Creation timestamp
    #[serde(default)]
    pub created: i64,
    /// Model
    #[serde(default)]
    pub model: String,
    /// Choices
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Usage (final chunk only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl ChatCompletionChunk {
    /// Chunk carrying a text delta
    #[must_use]
    pub fn delta(
        id: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            object: chunk_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some(assistant_role()),
                    content: Some(content.into()),
                    extra: Map::new(),
                },
                finish_reason,
                extra: Map::new(),
            }],
            usage: None,
            extra: Map::new(),
        }
    }
}

/// Streaming choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Index
    #[serde(default)]
    pub index: u32,
    /// Delta
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Finish reason
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Streaming delta
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role (first chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Fields the relay does not interpret (e.g. tool_calls)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Legacy completion response; also the shape of completion stream chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response ID
    #[serde(default)]
    pub id: String,
    /// Object type
    #[serde(default = "text_completion_object")]
    pub object: String,
    /// Creation timestamp
    #[serde(default)]
    pub created: i64,
    /// Model
    #[serde(default)]
    pub model: String,
    /// Choices
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    /// Usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn text_completion_object() -> String {
    "text_completion".to_string()
}

/// Legacy completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Generated text
    #[serde(default)]
    pub text: String,
    /// Index
    #[serde(default)]
    pub index: u32,
    /// Finish reason
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Fields the relay does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Embedding response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Object type
    #[serde(default = "list_object")]
    pub object: String,
    /// Embeddings
    #[serde(default)]
    pub data: Vec<Value>,
    /// Model
    #[serde(default)]
    pub model: String,
    /// Usage
    #[serde(default)]
    pub usage: Usage,
}

fn list_object() -> String {
    "list".to_string()
}

/// Moderation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResponse {
    /// Response ID
    #[serde(default)]
    pub id: String,
    /// Model
    #[serde(default)]
    pub model: String,
    /// Results
    #[serde(default)]
    pub results: Value,
}

/// Image response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResponse {
    /// Creation timestamp
    #[serde(default)]
    pub created: i64,
    /// Images
    #[serde(default)]
    pub data: Vec<ImageData>,
}

/// Single image result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageData {
    /// Hosted URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64 payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    /// Prompt after upstream rewriting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

/// Opaque upstream body relayed byte-for-byte (audio, plain text transcripts)
#[derive(Debug, Clone)]
pub struct BinaryResponse {
    /// Content type reported by the upstream
    pub content_type: String,
    /// Body bytes
    pub body: Bytes,
}

impl BinaryResponse {
    /// Transcript text: the `text` field of a JSON body, otherwise the body itself
    #[must_use]
    pub fn transcript_text(&self) -> String {
        if self.content_type.starts_with("application/json") {
            if let Ok(value) = serde_json::from_slice::<Value>(&self.body) {
                return value
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
            }
        }
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Model list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    /// Object type
    #[serde(default = "list_object")]
    pub object: String,
    /// Models
    #[serde(default)]
    pub data: Vec<ModelObject>,
}

impl ModelList {
    /// Wrap a list of models
    #[must_use]
    pub fn new(data: Vec<ModelObject>) -> Self {
        Self {
            object: list_object(),
            data,
        }
    }
}

/// Model entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelObject {
    /// Model ID
    pub id: String,
    /// Object type
    #[serde(default = "model_object")]
    pub object: String,
    /// Creation timestamp
    #[serde(default)]
    pub created: i64,
    /// Owner
    #[serde(default)]
    pub owned_by: String,
}

fn model_object() -> String {
    "model".to_string()
}

impl ModelObject {
    /// Create a model entry
    #[must_use]
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: model_object(),
            created: 0,
            owned_by: owned_by.into(),
        }
    }
}

/// Streamed chunk types the relay can meter
pub trait StreamChunk: Serialize + Send + 'static {
    /// Usage reported by the upstream on this chunk
    fn usage(&self) -> Option<Usage>;
    /// Generated text carried by this chunk
    fn delta_text(&self) -> String;
    /// Final chunk carrying only usage, modelled on `self`
    fn usage_chunk(&self, usage: Usage) -> Self;
    /// Whether the chunk carries any choices; usage-only chunks do not
    fn has_choices(&self) -> bool;
    /// Replace the reported model name
    fn set_model(&mut self, model: &str);
}

impl StreamChunk for ChatCompletionChunk {
    fn usage(&self) -> Option<Usage> {
        self.usage
    }

    fn delta_text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.delta.content.as_deref())
            .collect()
    }

    fn has_choices(&self) -> bool {
        !self.choices.is_empty()
    }

    fn set_model(&mut self, model: &str) {
        model.clone_into(&mut self.model);
    }

    fn usage_chunk(&self, usage: Usage) -> Self {
        Self {
            id: self.id.clone(),
            object: chunk_object(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: Some(usage),
            extra: Map::new(),
        }
    }
}

impl StreamChunk for CompletionResponse {
    fn usage(&self) -> Option<Usage> {
        self.usage
    }

    fn delta_text(&self) -> String {
        self.choices.iter().map(|c| c.text.as_str()).collect()
    }

    fn has_choices(&self) -> bool {
        !self.choices.is_empty()
    }

    fn set_model(&mut self, model: &str) {
        model.clone_into(&mut self.model);
    }

    fn usage_chunk(&self, usage: Usage) -> Self {
        Self {
            id: self.id.clone(),
            object: text_completion_object(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: Some(usage),
            extra: Map::new(),
        }
    }
}
