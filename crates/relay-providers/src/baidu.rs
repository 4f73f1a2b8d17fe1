//! # Baidu Adaptor
//!
//! ERNIE models on Baidu Qianfan (wenxinworkshop).
//!
//! - The `client_id|client_secret` key is exchanged for an OAuth access token
//!   that is cached per client and passed as the `access_token` query parameter
//! - Each model has its own endpoint path
//! - Errors arrive inside successful bodies as `error_code` / `error_msg`

use async_trait::async_trait;
use futures::StreamExt;
use http::{HeaderMap, HeaderValue, StatusCode};
use relay_core::{
    Adaptor, Channel, ChatCapability, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, EmbeddingCapability, EmbeddingRequest, EmbeddingResponse,
    EventStream, MessageRole, OpenAIError, ProviderType, RelayError, RelayResult, Usage,
};
use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::credential_cache::CredentialCache;
use crate::requester::{body_error, HttpRequester};

const CHAT_PATH: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat";
const EMBEDDINGS_PATH: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop/embeddings";

/// Access tokens are refreshed this long before Baidu expires them
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(3600);

/// Model name to wenxinworkshop endpoint; unknown names are used as the endpoint
#[must_use]
pub fn endpoint(model: &str) -> &str {
    match model {
        "ERNIE-Bot" => "completions",
        "ERNIE-Bot-turbo" => "eb-instant",
        "ERNIE-Bot-4" => "completions_pro",
        "BLOOMZ-7B" => "bloomz_7b1",
        "Embedding-V1" => "embedding-v1",
        other => other,
    }
}

#[derive(Debug, Default, Deserialize)]
struct BaiduError {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

impl BaiduError {
    fn into_openai(self) -> Option<OpenAIError> {
        (!self.error_msg.is_empty())
            .then(|| OpenAIError::new(self.error_msg, "baidu_error", self.error_code))
    }
}

/// Decode Baidu's `error_code` / `error_msg` body
pub fn baidu_error(_status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    serde_json::from_slice::<BaiduError>(body)
        .ok()
        .and_then(BaiduError::into_openai)
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Serialize)]
struct BaiduMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct BaiduChatRequest {
    messages: Vec<BaiduMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    stream: bool,
}

impl BaiduChatRequest {
    /// System prompts become a user turn acknowledged by the assistant
    fn from_chat(request: &ChatCompletionRequest, stream: bool) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            let content = message.text_content();
            match message.role {
                MessageRole::System | MessageRole::Developer => {
                    messages.push(BaiduMessage { role: "user", content });
                    messages.push(BaiduMessage {
                        role: "assistant",
                        content: "Okay".to_string(),
                    });
                }
                MessageRole::Assistant => messages.push(BaiduMessage {
                    role: "assistant",
                    content,
                }),
                MessageRole::User | MessageRole::Tool | MessageRole::Function => {
                    messages.push(BaiduMessage { role: "user", content });
                }
            }
        }

        Self {
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            user_id: request.user.clone(),
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BaiduChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    is_end: bool,
    #[serde(flatten)]
    error: BaiduError,
}

impl BaiduChatResponse {
    fn check(self) -> RelayResult<Self> {
        if self.error.error_msg.is_empty() {
            return Ok(self);
        }
        Err(body_error(OpenAIError::new(
            self.error.error_msg,
            "baidu_error",
            self.error.error_code,
        )))
    }

    /// Stream usage reports only the total; completion tokens are derived
    fn stream_usage(&self) -> Option<Usage> {
        self.usage.filter(|u| u.total_tokens != 0).map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.total_tokens.saturating_sub(u.prompt_tokens),
            total_tokens: u.total_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BaiduEmbeddingResponse {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    usage: Usage,
    #[serde(flatten)]
    error: BaiduError,
}

/// Embedding input as the list of strings Baidu expects
fn embedding_input(input: &Value) -> Vec<String> {
    match input {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Adaptor for Baidu ERNIE
pub struct BaiduAdaptor {
    channel: Channel,
    client_id: String,
    client_secret: SecretString,
    tokens: Arc<CredentialCache<String>>,
    requester: Arc<HttpRequester>,
}

impl BaiduAdaptor {
    /// Create an adaptor for `channel`; `tokens` is shared across Baidu channels
    #[must_use]
    pub fn new(
        channel: Channel,
        client_id: String,
        client_secret: SecretString,
        tokens: Arc<CredentialCache<String>>,
        requester: Arc<HttpRequester>,
    ) -> Self {
        Self {
            channel,
            client_id,
            client_secret,
            tokens,
            requester,
        }
    }

    async fn access_token(&self) -> RelayResult<String> {
        let cache_key = format!("baidu:{}", self.client_id);
        self.tokens
            .get_or_refresh(&cache_key, || self.exchange_token())
            .await
    }

    async fn exchange_token(&self) -> RelayResult<(String, Duration)> {
        debug!(channel_id = self.channel.id, "Exchanging Baidu access token");
        let url = format!("{}/oauth/2.0/token", self.channel.base_url());
        let builder = self
            .requester
            .client(self.channel.proxy.as_deref())?
            .post(url)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret().as_str()),
            ])
            .header(http::header::ACCEPT, "application/json");

        let token: AccessTokenResponse = self.requester.send_json(builder, baidu_error).await?;
        if !token.error.is_empty() {
            return Err(RelayError::channel_config(format!(
                "baidu token exchange failed: {}: {}",
                token.error, token.error_description
            )));
        }
        if token.access_token.is_empty() {
            return Err(RelayError::channel_config(
                "baidu token exchange returned an empty access token",
            ));
        }

        let ttl = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        Ok((token.access_token, ttl))
    }

    async fn post(&self, path: &str, model: &str) -> RelayResult<RequestBuilder> {
        let url = self.full_request_url(path, model).await?;
        let mut headers = HeaderMap::new();
        self.request_headers(&mut headers).await?;
        debug!(channel_id = self.channel.id, model = %model, "Dispatching Baidu request");
        Ok(self
            .requester
            .client(self.channel.proxy.as_deref())?
            .post(url)
            .headers(headers))
    }
}

impl std::fmt::Debug for BaiduAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaiduAdaptor")
            .field("channel_id", &self.channel.id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Adaptor for BaiduAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Baidu
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()> {
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(())
    }

    async fn full_request_url(&self, path: &str, model: &str) -> RelayResult<String> {
        let token = self.access_token().await?;
        let path = if path.ends_with("embeddings") {
            EMBEDDINGS_PATH
        } else {
            CHAT_PATH
        };
        Ok(format!(
            "{}{path}/{}?access_token={token}",
            self.channel.base_url(),
            endpoint(model)
        ))
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        baidu_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }

    fn embeddings(&self) -> Option<&dyn EmbeddingCapability> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapability for BaiduAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let body = BaiduChatRequest::from_chat(request, false);
        let builder = self.post("chat", &request.model).await?.json(&body);
        let response: BaiduChatResponse = self.requester.send_json(builder, baidu_error).await?;
        let response = response.check()?;

        Ok(ChatCompletionResponse::single(
            response.id,
            &request.model,
            response.result,
            Some("stop".to_string()),
            response.usage.unwrap_or_default(),
        ))
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let body = BaiduChatRequest::from_chat(request, true);
        let builder = self
            .post("chat", &request.model)
            .await?
            .header(http::header::ACCEPT, "text/event-stream")
            .json(&body);
        let lines = self.requester.sse_lines(builder, baidu_error).await?;
        let model = request.model.clone();

        Ok(EventStream::spawn(async_stream::try_stream! {
            let mut lines = Box::pin(lines);
            while let Some(line) = lines.next().await {
                let line = line?;
                let chunk = match serde_json::from_str::<BaiduChatResponse>(&line) {
                    Ok(chunk) => chunk.check()?,
                    Err(e) => {
                        warn!(error = %e, data = %line, "Skipping unrecognized Baidu chunk");
                        continue;
                    }
                };

                let finish_reason = chunk.is_end.then(|| "stop".to_string());
                let mut delta = ChatCompletionChunk::delta(&chunk.id, &model, &chunk.result, finish_reason);
                delta.usage = chunk.stream_usage();
                yield delta;

                if chunk.is_end {
                    break;
                }
            }
        }))
    }
}

#[async_trait]
impl EmbeddingCapability for BaiduAdaptor {
    async fn embeddings(&self, request: &EmbeddingRequest) -> RelayResult<EmbeddingResponse> {
        let body = serde_json::json!({ "input": embedding_input(&request.input) });
        let builder = self.post("embeddings", &request.model).await?.json(&body);
        let response: BaiduEmbeddingResponse = self.requester.send_json(builder, baidu_error).await?;
        if let Some(error) = response.error.into_openai() {
            return Err(body_error(error));
        }

        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: response.data,
            model: request.model.clone(),
            usage: response.usage,
        })
    }
}
