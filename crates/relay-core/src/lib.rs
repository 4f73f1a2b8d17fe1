//! # Relay Core
//!
//! Core types, traits, and error handling for the LLM relay.
//!
//! This crate provides the foundational pieces shared by every other crate:
//! - OpenAI-shaped request, response and stream chunk types
//! - The `RelayError` type and the OpenAI error envelope
//! - Channel, token and pricing data model
//! - Structured composite channel credentials
//! - The provider adaptor contract with optional capabilities
//! - Collaborator traits (datastore, pricing, notifier, storage, token counter)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod error;
pub mod provider;
pub mod request;
pub mod response;
pub mod store;
pub mod streaming;
pub mod types;

// Re-export commonly used types
pub use credentials::{AwsCredential, ChannelCredential, CredentialError};
pub use error::{ErrorCode, OpenAIError, OpenAIErrorEnvelope, RelayError, RelayResult, RoutingFailure};
pub use provider::{
    Adaptor, BalanceCapability, Capabilities, ChatCapability, CompletionCapability,
    EmbeddingCapability, ImageEditCapability, ImageGenerationCapability,
    ImageVariationCapability, ModelListCapability, ModerationCapability, SpeechCapability,
    TranscriptionCapability, TranslationCapability,
};
pub use request::{
    AudioRequest, ChatCompletionRequest, ChatMessage, CompletionRequest, ContentPart,
    EmbeddingRequest, FileUpload, ImageEditRequest, ImageRequest, MessageContent, MessageRole,
    ModerationRequest, SpeechRequest, StreamOptions, ToolDefinition,
};
pub use response::{
    BinaryResponse, ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkDelta,
    CompletionChoice, CompletionResponse, EmbeddingResponse, ImageData, ImageResponse,
    ModelList, ModelObject, ModerationResponse, ResponseMessage, StreamChunk, Usage,
};
pub use store::{
    Datastore, LogNotifier, MemoryDatastore, Notifier, ObjectStorage, PricingTable,
    TokenCounter,
};
pub use streaming::EventStream;
pub use types::{
    ApiToken, Channel, ChannelId, ChannelStatus, Price, PriceType, ProviderType, TokenId,
    UsageLog, User, UserId,
};
