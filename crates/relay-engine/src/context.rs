//! Per-request relay context.

use relay_core::{ApiToken, ChannelId};

/// Endpoint family being relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    /// `/v1/chat/completions`
    Chat,
    /// `/v1/completions`
    Completion,
    /// `/v1/embeddings`
    Embeddings,
    /// `/v1/moderations`
    Moderation,
    /// `/v1/audio/speech`
    Speech,
    /// `/v1/audio/transcriptions`
    Transcription,
    /// `/v1/audio/translations`
    Translation,
    /// `/v1/images/generations`
    ImageGeneration,
    /// `/v1/images/edits`
    ImageEdit,
    /// `/v1/images/variations`
    ImageVariation,
}

impl RelayKind {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Completion => "completion",
            Self::Embeddings => "embeddings",
            Self::Moderation => "moderation",
            Self::Speech => "speech",
            Self::Transcription => "transcription",
            Self::Translation => "translation",
            Self::ImageGeneration => "image_generation",
            Self::ImageEdit => "image_edit",
            Self::ImageVariation => "image_variation",
        }
    }

    /// Capability name reported when a channel lacks this action
    #[must_use]
    pub fn action(self) -> &'static str {
        match self {
            Self::Chat => "chat completions",
            Self::Completion => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderation => "moderations",
            Self::Speech => "speech",
            Self::Transcription => "transcriptions",
            Self::Translation => "translations",
            Self::ImageGeneration => "image generations",
            Self::ImageEdit => "image edits",
            Self::ImageVariation => "image variations",
        }
    }
}

/// Caller identity and routing hints for one request
#[derive(Debug, Clone)]
pub struct RelayContext {
    /// Request id, echoed in logs and error messages
    pub request_id: String,
    /// Authenticated token
    pub token: ApiToken,
    /// Channel pinned by the caller, if allowed
    pub pinned_channel: Option<ChannelId>,
}

impl RelayContext {
    /// Context for `token` with a fresh request id
    #[must_use]
    pub fn new(token: ApiToken) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            token,
            pinned_channel: None,
        }
    }

    /// Use a caller-supplied request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Pin the request to a channel
    #[must_use]
    pub fn with_pinned_channel(mut self, channel: Option<ChannelId>) -> Self {
        self.pinned_channel = channel;
        self
    }

    /// Group the token routes under
    #[must_use]
    pub fn group(&self) -> &str {
        &self.token.group
    }

    /// Whether the request is pinned
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned_channel.is_some()
    }
}
