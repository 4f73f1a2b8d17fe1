//! OpenAI-compatible adaptor.
//!
//! Serves OpenAI itself and every upstream speaking the same wire protocol
//! (Custom, DeepSeek, Mistral, Groq, Moonshot). Azure differs only in URL shape
//! and authentication:
//! - URL: `{base}/openai/deployments/{deployment}/chat/completions?api-version=`
//! - Authentication via API key in the `api-key` header

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, StatusCode};
use relay_core::{
    Adaptor, AudioRequest, BalanceCapability, BinaryResponse, Channel, ChatCapability,
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, CompletionCapability,
    CompletionRequest, CompletionResponse, EmbeddingCapability, EmbeddingRequest, EmbeddingResponse,
    EventStream, FileUpload, ImageEditCapability, ImageEditRequest, ImageGenerationCapability,
    ImageRequest, ImageResponse, ImageVariationCapability, ModelList, ModelListCapability,
    ModelObject, ModerationCapability, ModerationRequest, ModerationResponse, OpenAIError,
    OpenAIErrorEnvelope, ProviderType, RelayError, RelayResult, SpeechCapability, SpeechRequest,
    StreamOptions, TranscriptionCapability, TranslationCapability,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::requester::{json_events, HttpRequester};

/// Azure OpenAI API version used when the channel does not set one
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

/// Adaptor for OpenAI and OpenAI-compatible upstreams
pub struct OpenAIAdaptor {
    channel: Channel,
    api_key: SecretString,
    requester: Arc<HttpRequester>,
}

impl OpenAIAdaptor {
    /// Create an adaptor for `channel`
    #[must_use]
    pub fn new(channel: Channel, api_key: SecretString, requester: Arc<HttpRequester>) -> Self {
        Self {
            channel,
            api_key,
            requester,
        }
    }

    fn is_azure(&self) -> bool {
        self.channel.provider == ProviderType::Azure
    }

    fn client(&self) -> RelayResult<Client> {
        self.requester.client(self.channel.proxy.as_deref())
    }

    async fn authorized(&self, builder: RequestBuilder) -> RelayResult<RequestBuilder> {
        let mut headers = HeaderMap::new();
        self.request_headers(&mut headers).await?;
        Ok(builder.headers(headers))
    }

    async fn post(&self, path: &str, model: &str) -> RelayResult<RequestBuilder> {
        let url = self.full_request_url(path, model).await?;
        debug!(channel_id = self.channel.id, url = %url, "Dispatching upstream request");
        self.authorized(self.client()?.post(url)).await
    }

    async fn multipart(
        &self,
        path: &str,
        model: &str,
        form: Form,
    ) -> RelayResult<BinaryResponse> {
        let request = self.post(path, model).await?.multipart(form);
        self.requester.send_binary(request, openai_error).await
    }

    async fn image_multipart(&self, path: &str, request: &ImageEditRequest) -> RelayResult<ImageResponse> {
        let mut form = Form::new()
            .text("model", request.model.clone())
            .part("image", file_part(&request.image)?);
        if let Some(mask) = &request.mask {
            form = form.part("mask", file_part(mask)?);
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }
        for (name, value) in &request.fields {
            form = form.text(name.clone(), value.clone());
        }

        let builder = self.post(path, &request.model).await?.multipart(form);
        self.requester.send_json(builder, openai_error).await
    }

    async fn audio(&self, path: &str, request: &AudioRequest) -> RelayResult<BinaryResponse> {
        let mut form = Form::new()
            .text("model", request.model.clone())
            .part("file", file_part(&request.file)?);
        for (name, value) in &request.fields {
            form = form.text(name.clone(), value.clone());
        }
        self.multipart(path, &request.model, form).await
    }

    /// Ask OpenAI itself to report usage on streams; compatible upstreams
    /// differ in whether they accept `stream_options`.
    fn stream_options(&self, requested: Option<StreamOptions>) -> Option<StreamOptions> {
        if self.channel.provider == ProviderType::OpenAI {
            Some(StreamOptions {
                include_usage: true,
            })
        } else {
            requested
        }
    }
}

impl std::fmt::Debug for OpenAIAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIAdaptor")
            .field("channel_id", &self.channel.id)
            .field("provider", &self.channel.provider)
            .finish_non_exhaustive()
    }
}

/// Decode the OpenAI error envelope
pub fn openai_error(_status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    serde_json::from_slice::<OpenAIErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.error)
}

fn file_part(file: &FileUpload) -> RelayResult<Part> {
    let part = Part::bytes(file.data.to_vec()).file_name(file.filename.clone());
    match &file.content_type {
        Some(content_type) => part.mime_str(content_type).map_err(|e| {
            RelayError::validation(
                format!("invalid content type {content_type}: {e}"),
                None,
                "invalid_file",
            )
        }),
        None => Ok(part),
    }
}

/// Azure deployment names cannot contain dots (`gpt-3.5-turbo` → `gpt-35-turbo`)
fn azure_deployment(model: &str) -> String {
    model.replace('.', "")
}

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn provider_type(&self) -> ProviderType {
        self.channel.provider
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()> {
        let key = self.api_key.expose_secret();
        let (name, value) = if self.is_azure() {
            ("api-key", key.to_string())
        } else {
            ("authorization", format!("Bearer {key}"))
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|_| RelayError::channel_config("channel key contains invalid header characters"))?;
        headers.insert(name, value);
        Ok(())
    }

    async fn full_request_url(&self, path: &str, model: &str) -> RelayResult<String> {
        let base = self.channel.base_url();
        if !self.is_azure() {
            return Ok(format!("{base}{path}"));
        }

        if base.is_empty() {
            return Err(RelayError::channel_config(
                "azure channel requires a base URL",
            ));
        }
        let api_version = self
            .channel
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_AZURE_API_VERSION);
        let suffix = path.strip_prefix("/v1").unwrap_or(path);
        Ok(format!(
            "{base}/openai/deployments/{}{suffix}?api-version={api_version}",
            azure_deployment(model)
        ))
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        openai_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }

    fn completion(&self) -> Option<&dyn CompletionCapability> {
        Some(self)
    }

    fn embeddings(&self) -> Option<&dyn EmbeddingCapability> {
        Some(self)
    }

    fn moderation(&self) -> Option<&dyn ModerationCapability> {
        Some(self)
    }

    fn speech(&self) -> Option<&dyn SpeechCapability> {
        Some(self)
    }

    fn transcription(&self) -> Option<&dyn TranscriptionCapability> {
        Some(self)
    }

    fn translation(&self) -> Option<&dyn TranslationCapability> {
        Some(self)
    }

    fn image_generation(&self) -> Option<&dyn ImageGenerationCapability> {
        Some(self)
    }

    fn image_edit(&self) -> Option<&dyn ImageEditCapability> {
        Some(self)
    }

    fn image_variation(&self) -> Option<&dyn ImageVariationCapability> {
        Some(self)
    }

    fn model_list(&self) -> Option<&dyn ModelListCapability> {
        (!self.is_azure()).then_some(self as &dyn ModelListCapability)
    }

    fn balance(&self) -> Option<&dyn BalanceCapability> {
        matches!(self.channel.provider, ProviderType::OpenAI | ProviderType::Custom)
            .then_some(self as &dyn BalanceCapability)
    }
}

#[async_trait]
impl ChatCapability for OpenAIAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let mut body = request.clone();
        body.stream = false;
        body.stream_options = None;

        let builder = self.post("/v1/chat/completions", &body.model).await?.json(&body);
        self.requester.send_json(builder, openai_error).await
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let mut body = request.clone();
        body.stream = true;
        body.stream_options = self.stream_options(body.stream_options);

        let builder = self.post("/v1/chat/completions", &body.model).await?.json(&body);
        let lines = self.requester.sse_lines(builder, openai_error).await?;
        Ok(json_events(lines))
    }
}

#[async_trait]
impl CompletionCapability for OpenAIAdaptor {
    async fn completion(&self, request: &CompletionRequest) -> RelayResult<CompletionResponse> {
        let mut body = request.clone();
        body.stream = false;
        body.stream_options = None;

        let builder = self.post("/v1/completions", &body.model).await?.json(&body);
        self.requester.send_json(builder, openai_error).await
    }

    async fn completion_stream(
        &self,
        request: &CompletionRequest,
    ) -> RelayResult<EventStream<CompletionResponse>> {
        let mut body = request.clone();
        body.stream = true;
        body.stream_options = self.stream_options(body.stream_options);

        let builder = self.post("/v1/completions", &body.model).await?.json(&body);
        let lines = self.requester.sse_lines(builder, openai_error).await?;
        Ok(json_events(lines))
    }
}

#[async_trait]
impl EmbeddingCapability for OpenAIAdaptor {
    async fn embeddings(&self, request: &EmbeddingRequest) -> RelayResult<EmbeddingResponse> {
        let builder = self.post("/v1/embeddings", &request.model).await?.json(request);
        self.requester.send_json(builder, openai_error).await
    }
}

#[async_trait]
impl ModerationCapability for OpenAIAdaptor {
    async fn moderation(&self, request: &ModerationRequest) -> RelayResult<ModerationResponse> {
        let builder = self.post("/v1/moderations", &request.model).await?.json(request);
        self.requester.send_json(builder, openai_error).await
    }
}

#[async_trait]
impl SpeechCapability for OpenAIAdaptor {
    async fn speech(&self, request: &SpeechRequest) -> RelayResult<BinaryResponse> {
        let builder = self.post("/v1/audio/speech", &request.model).await?.json(request);
        self.requester.send_binary(builder, openai_error).await
    }
}

#[async_trait]
impl TranscriptionCapability for OpenAIAdaptor {
    async fn transcription(&self, request: &AudioRequest) -> RelayResult<BinaryResponse> {
        self.audio("/v1/audio/transcriptions", request).await
    }
}

#[async_trait]
impl TranslationCapability for OpenAIAdaptor {
    async fn translation(&self, request: &AudioRequest) -> RelayResult<BinaryResponse> {
        self.audio("/v1/audio/translations", request).await
    }
}

#[async_trait]
impl ImageGenerationCapability for OpenAIAdaptor {
    async fn image_generation(&self, request: &ImageRequest) -> RelayResult<ImageResponse> {
        let builder = self
            .post("/v1/images/generations", &request.model)
            .await?
            .json(request);
        self.requester.send_json(builder, openai_error).await
    }
}

#[async_trait]
impl ImageEditCapability for OpenAIAdaptor {
    async fn image_edit(&self, request: &ImageEditRequest) -> RelayResult<ImageResponse> {
        self.image_multipart("/v1/images/edits", request).await
    }
}

#[async_trait]
impl ImageVariationCapability for OpenAIAdaptor {
    async fn image_variation(&self, request: &ImageEditRequest) -> RelayResult<ImageResponse> {
        self.image_multipart("/v1/images/variations", request).await
    }
}

#[async_trait]
impl ModelListCapability for OpenAIAdaptor {
    async fn list_models(&self) -> RelayResult<Vec<ModelObject>> {
        let url = self.full_request_url("/v1/models", "").await?;
        let builder = self.authorized(self.client()?.get(url)).await?;
        let list: ModelList = self.requester.send_json(builder, openai_error).await?;
        Ok(list.data)
    }
}

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(default)]
    hard_limit_usd: f64,
}

#[derive(Debug, Deserialize)]
struct BillingUsage {
    /// Cents
    #[serde(default)]
    total_usage: f64,
}

#[async_trait]
impl BalanceCapability for OpenAIAdaptor {
    async fn balance(&self) -> RelayResult<f64> {
        let base = self.channel.base_url();
        let client = self.client()?;

        let subscription_url = format!("{base}/v1/dashboard/billing/subscription");
        let builder = self.authorized(client.get(subscription_url)).await?;
        let subscription: Subscription = self.requester.send_json(builder, openai_error).await?;

        let today = chrono::Utc::now().date_naive();
        let start = today - chrono::Duration::days(100);
        let end = today + chrono::Duration::days(1);
        let usage_url = format!(
            "{base}/v1/dashboard/billing/usage?start_date={}&end_date={}",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        let builder = self.authorized(client.get(usage_url)).await?;
        let usage: BillingUsage = self.requester.send_json(builder, openai_error).await?;

        Ok(subscription.hard_limit_usd - usage.total_usage / 100.0)
    }
}
