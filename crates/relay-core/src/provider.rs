//! Provider adaptor contract.
//!
//! Every upstream family implements [`Adaptor`]: header and URL construction,
//! model mapping and error normalization. The relay actions an adaptor supports
//! are exposed as optional capability objects, so asking a channel for
//! something it cannot do is a lookup that returns `None`, not a runtime
//! "not implemented" path inside the adaptor.

use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::error::{OpenAIError, RelayResult};
use crate::request::{
    AudioRequest, ChatCompletionRequest, CompletionRequest, EmbeddingRequest, ImageEditRequest,
    ImageRequest, ModerationRequest, SpeechRequest,
};
use crate::response::{
    BinaryResponse, ChatCompletionChunk, ChatCompletionResponse, CompletionResponse,
    EmbeddingResponse, ImageResponse, ModelObject, ModerationResponse,
};
use crate::streaming::EventStream;
use crate::types::{Channel, ProviderType};

/// Provider-facing half of a channel
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Provider family
    fn provider_type(&self) -> ProviderType;

    /// Channel this adaptor was built for
    fn channel(&self) -> &Channel;

    /// Add authentication and provider headers for an upstream call
    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()>;

    /// Full upstream URL for an OpenAI-style `path` and the upstream model name
    async fn full_request_url(&self, path: &str, model: &str) -> RelayResult<String>;

    /// Caller model name to upstream model name
    fn model_mapping(&self, model: &str) -> RelayResult<String> {
        self.channel().map_model(model)
    }

    /// Normalize a provider error body; `None` when the body is not recognized
    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError>;

    /// Chat completions
    fn chat(&self) -> Option<&dyn ChatCapability> {
        None
    }

    /// Legacy completions
    fn completion(&self) -> Option<&dyn CompletionCapability> {
        None
    }

    /// Embeddings
    fn embeddings(&self) -> Option<&dyn EmbeddingCapability> {
        None
    }

    /// Moderations
    fn moderation(&self) -> Option<&dyn ModerationCapability> {
        None
    }

    /// Text to speech
    fn speech(&self) -> Option<&dyn SpeechCapability> {
        None
    }

    /// Audio transcription
    fn transcription(&self) -> Option<&dyn TranscriptionCapability> {
        None
    }

    /// Audio translation
    fn translation(&self) -> Option<&dyn TranslationCapability> {
        None
    }

    /// Image generation
    fn image_generation(&self) -> Option<&dyn ImageGenerationCapability> {
        None
    }

    /// Image edits
    fn image_edit(&self) -> Option<&dyn ImageEditCapability> {
        None
    }

    /// Image variations
    fn image_variation(&self) -> Option<&dyn ImageVariationCapability> {
        None
    }

    /// Upstream model listing
    fn model_list(&self) -> Option<&dyn ModelListCapability> {
        None
    }

    /// Upstream balance lookup
    fn balance(&self) -> Option<&dyn BalanceCapability> {
        None
    }

    /// Snapshot of the supported capabilities
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: self.chat().is_some(),
            completion: self.completion().is_some(),
            embeddings: self.embeddings().is_some(),
            moderation: self.moderation().is_some(),
            speech: self.speech().is_some(),
            transcription: self.transcription().is_some(),
            translation: self.translation().is_some(),
            image_generation: self.image_generation().is_some(),
            image_edit: self.image_edit().is_some(),
            image_variation: self.image_variation().is_some(),
            model_list: self.model_list().is_some(),
            balance: self.balance().is_some(),
        }
    }
}

/// Capability flags of an adaptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Chat completions
    pub chat: bool,
    /// Legacy completions
    pub completion: bool,
    /// Embeddings
    pub embeddings: bool,
    /// Moderations
    pub moderation: bool,
    /// Text to speech
    pub speech: bool,
    /// Transcription
    pub transcription: bool,
    /// Translation
    pub translation: bool,
    /// Image generation
    pub image_generation: bool,
    /// Image edits
    pub image_edit: bool,
    /// Image variations
    pub image_variation: bool,
    /// Model listing
    pub model_list: bool,
    /// Balance lookup
    pub balance: bool,
}

/// Chat completions
#[async_trait]
pub trait ChatCapability: Send + Sync {
    /// Buffered chat completion
    async fn chat_completion(&self, request: &ChatCompletionRequest)
        -> RelayResult<ChatCompletionResponse>;

    /// Streaming chat completion.
    ///
    /// Returns only after the upstream accepted the request, so connection and
    /// status failures surface here rather than inside the stream.
    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>>;
}

/// Legacy completions
#[async_trait]
pub trait CompletionCapability: Send + Sync {
    /// Buffered completion
    async fn completion(&self, request: &CompletionRequest) -> RelayResult<CompletionResponse>;

    /// Streaming completion
    async fn completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> RelayResult<EventStream<CompletionResponse>>;
}

/// Embeddings
#[async_trait]
pub trait EmbeddingCapability: Send + Sync {
    /// Create embeddings
    async fn embeddings(&self, request: &EmbeddingRequest) -> RelayResult<EmbeddingResponse>;
}

/// Moderations
#[async_trait]
pub trait ModerationCapability: Send + Sync {
    /// Classify input
    async fn moderation(&self, request: &ModerationRequest) -> RelayResult<ModerationResponse>;
}

/// Text to speech
#[async_trait]
pub trait SpeechCapability: Send + Sync {
    /// Synthesize audio
    async fn speech(&self, request: &SpeechRequest) -> RelayResult<BinaryResponse>;
}

/// Audio transcription
#[async_trait]
pub trait TranscriptionCapability: Send + Sync {
    /// Transcribe audio
    async fn transcription(&self, request: &AudioRequest) -> RelayResult<BinaryResponse>;
}

/// Audio translation
#[async_trait]
pub trait TranslationCapability: Send + Sync {
    /// Translate audio to English text
    async fn translation(&self, request: &AudioRequest) -> RelayResult<BinaryResponse>;
}

/// Image generation
#[async_trait]
pub trait ImageGenerationCapability: Send + Sync {
    /// Generate images
    async fn image_generation(&self, request: &ImageRequest) -> RelayResult<ImageResponse>;
}

/// Image edits
#[async_trait]
pub trait ImageEditCapability: Send + Sync {
    /// Edit an image
    async fn image_edit(&self, request: &ImageEditRequest) -> RelayResult<ImageResponse>;
}

/// Image variations
#[async_trait]
pub trait ImageVariationCapability: Send + Sync {
    /// Create variations of an image
    async fn image_variation(&self, request: &ImageEditRequest) -> RelayResult<ImageResponse>;
}

/// Upstream model listing
#[async_trait]
pub trait ModelListCapability: Send + Sync {
    /// Models the upstream account can use
    async fn list_models(&self) -> RelayResult<Vec<ModelObject>>;
}

/// Upstream balance
#[async_trait]
pub trait BalanceCapability: Send + Sync {
    /// Remaining balance in the provider's currency
    async fn balance(&self) -> RelayResult<f64>;
}
