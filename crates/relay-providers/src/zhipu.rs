//! # Zhipu Adaptor
//!
//! GLM models through the v4 `paas` API.
//!
//! - Authentication is a short-lived HS256 JWT derived from the `id.secret`
//!   channel key and sent as the raw `Authorization` value
//! - The JWT is cached per key for a day and regenerated once expired
//! - Chat, embeddings and image generation are OpenAI-shaped apart from role
//!   and `top_p` restrictions

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, StatusCode};
use relay_core::{
    Adaptor, Channel, ChatCapability, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, EmbeddingCapability, EmbeddingRequest, EmbeddingResponse, ErrorCode,
    EventStream, ImageGenerationCapability, ImageRequest, ImageResponse, MessageRole, OpenAIError,
    ProviderType, RelayError, RelayResult,
};
use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::credential_cache::CredentialCache;
use crate::requester::{json_events, HttpRequester};

/// Lifetime written into each JWT
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 3600);

/// Tokens are dropped from the cache a little before they expire upstream
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ZhipuErrorEnvelope {
    error: ZhipuError,
}

#[derive(Debug, Deserialize)]
struct ZhipuError {
    #[serde(default)]
    code: Option<ErrorCode>,
    #[serde(default)]
    message: String,
}

/// Decode Zhipu's `{"error":{"code","message"}}` body
pub fn zhipu_error(_status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    let envelope = serde_json::from_slice::<ZhipuErrorEnvelope>(body).ok()?;
    if envelope.error.message.is_empty() {
        return None;
    }
    let mut error = OpenAIError::new(envelope.error.message, "zhipu_error", "zhipu_error");
    error.code = envelope.error.code;
    Some(error)
}

/// Build the signed JWT for key `id` at `now_ms` (milliseconds since the epoch)
pub fn sign_token(id: &str, secret: &str, now_ms: i64) -> RelayResult<String> {
    let lifetime_ms = i64::try_from(TOKEN_LIFETIME.as_millis()).unwrap_or(i64::MAX);
    let header = json!({ "alg": "HS256", "sign_type": "SIGN" });
    let claims = json!({
        "api_key": id,
        "exp": now_ms + lifetime_ms,
        "timestamp": now_ms,
    });

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| RelayError::internal(format!("invalid zhipu signing key: {e}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Zhipu accepts `system`, `user`, `assistant` and `tool`
fn convert_role(role: MessageRole) -> MessageRole {
    match role {
        MessageRole::Function => MessageRole::Tool,
        MessageRole::System | MessageRole::Assistant | MessageRole::Tool => role,
        MessageRole::Developer | MessageRole::User => MessageRole::User,
    }
}

/// `top_p` must lie strictly inside `(0, 1)`
fn convert_top_p(top_p: f32) -> f32 {
    if top_p <= 0.0 {
        0.1
    } else if top_p >= 1.0 {
        0.9
    } else {
        top_p
    }
}

fn chat_body(request: &ChatCompletionRequest, stream: bool) -> ChatCompletionRequest {
    let mut body = request.clone();
    for message in &mut body.messages {
        message.role = convert_role(message.role);
    }
    body.top_p = body.top_p.map(convert_top_p);
    body.stream = stream;
    body.stream_options = None;
    body
}

/// Adaptor for Zhipu GLM
pub struct ZhipuAdaptor {
    channel: Channel,
    key_id: String,
    secret: SecretString,
    tokens: Arc<CredentialCache<String>>,
    requester: Arc<HttpRequester>,
}

impl ZhipuAdaptor {
    /// Create an adaptor for `channel`; `tokens` is shared across Zhipu channels
    #[must_use]
    pub fn new(
        channel: Channel,
        key_id: String,
        secret: SecretString,
        tokens: Arc<CredentialCache<String>>,
        requester: Arc<HttpRequester>,
    ) -> Self {
        Self {
            channel,
            key_id,
            secret,
            tokens,
            requester,
        }
    }

    async fn token(&self) -> RelayResult<String> {
        let cache_key = format!("zhipu:{}", self.key_id);
        self.tokens
            .get_or_refresh(&cache_key, || async {
                debug!(channel_id = self.channel.id, "Signing new Zhipu token");
                let now_ms = chrono::Utc::now().timestamp_millis();
                let token = sign_token(&self.key_id, self.secret.expose_secret(), now_ms)?;
                Ok((token, TOKEN_LIFETIME - TOKEN_REFRESH_MARGIN))
            })
            .await
    }

    async fn post(&self, path: &str, model: &str) -> RelayResult<RequestBuilder> {
        let url = self.full_request_url(path, model).await?;
        let mut headers = HeaderMap::new();
        self.request_headers(&mut headers).await?;
        debug!(channel_id = self.channel.id, url = %url, "Dispatching Zhipu request");
        Ok(self
            .requester
            .client(self.channel.proxy.as_deref())?
            .post(url)
            .headers(headers))
    }
}

impl std::fmt::Debug for ZhipuAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZhipuAdaptor")
            .field("channel_id", &self.channel.id)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Adaptor for ZhipuAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Zhipu
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()> {
        let token = self.token().await?;
        let value = HeaderValue::from_str(&token)
            .map_err(|_| RelayError::channel_config("zhipu token contains invalid header characters"))?;
        headers.insert(http::header::AUTHORIZATION, value);
        Ok(())
    }

    async fn full_request_url(&self, path: &str, _model: &str) -> RelayResult<String> {
        let suffix = path.strip_prefix("/v1").unwrap_or(path);
        Ok(format!("{}{suffix}", self.channel.base_url()))
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        zhipu_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }

    fn embeddings(&self) -> Option<&dyn EmbeddingCapability> {
        Some(self)
    }

    fn image_generation(&self) -> Option<&dyn ImageGenerationCapability> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapability for ZhipuAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let body = chat_body(request, false);
        let builder = self.post("/chat/completions", &body.model).await?.json(&body);
        self.requester.send_json(builder, zhipu_error).await
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let body = chat_body(request, true);
        let builder = self.post("/chat/completions", &body.model).await?.json(&body);
        let lines = self.requester.sse_lines(builder, zhipu_error).await?;
        Ok(json_events(lines))
    }
}

#[async_trait]
impl EmbeddingCapability for ZhipuAdaptor {
    async fn embeddings(&self, request: &EmbeddingRequest) -> RelayResult<EmbeddingResponse> {
        let body = json!({ "model": request.model, "input": request.input });
        let builder = self.post("/embeddings", &request.model).await?.json(&body);
        self.requester.send_json(builder, zhipu_error).await
    }
}

#[async_trait]
impl ImageGenerationCapability for ZhipuAdaptor {
    async fn image_generation(&self, request: &ImageRequest) -> RelayResult<ImageResponse> {
        let body = json!({ "model": request.model, "prompt": request.prompt });
        let builder = self
            .post("/images/generations", &request.model)
            .await?
            .json(&body);
        self.requester.send_json(builder, zhipu_error).await
    }
}
