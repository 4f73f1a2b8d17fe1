//! # Xunfei Adaptor
//!
//! Spark chat over a websocket.
//!
//! - The URL carries an HMAC-SHA256 signature of `host`, `date` and the
//!   request line; no headers are sent
//! - The channel key is `app_id|api_key|api_secret`
//! - One request frame goes up, reply frames come back until `status` 2
//! - A non-zero `header.code` is an error in any frame
//! - Channel proxies are not applied to the websocket

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use http::{HeaderMap, StatusCode};
use relay_core::{
    Adaptor, Channel, ChatCapability, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ErrorCode, EventStream, MessageRole, OpenAIError, ProviderType,
    RelayError, RelayResult, Usage,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::requester::{body_error, normalize_error, HttpRequester};

/// API version used when the channel does not set one
pub const DEFAULT_API_VERSION: &str = "v1.1";

/// Reply status of the last frame
const FINAL_STATUS: i64 = 2;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct XunfeiEnvelope {
    #[serde(default)]
    header: Option<XunfeiHeader>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct XunfeiHeader {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    sid: String,
    #[serde(default)]
    status: i64,
}

/// Decode the `{"header":{"code","message"}}` frame Spark reports errors in.
///
/// Handshake rejections carry a bare `{"message"}` body instead.
pub fn xunfei_error(status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    let envelope = serde_json::from_slice::<XunfeiEnvelope>(body).ok()?;
    match (envelope.header, envelope.message) {
        (Some(header), _) => (header.code != 0)
            .then(|| OpenAIError::new(header.message, "xunfei_error", ErrorCode::Int(header.code))),
        (None, Some(message)) if !status.is_success() => Some(OpenAIError::new(
            message,
            "xunfei_error",
            ErrorCode::Int(i64::from(status.as_u16())),
        )),
        (None, _) => None,
    }
}

/// Spark `domain` for an API version: `general` for v1.1, `general<major>` otherwise
#[must_use]
pub fn domain(api_version: &str) -> String {
    if api_version == DEFAULT_API_VERSION {
        return "general".to_string();
    }
    let major = api_version.split('.').next().unwrap_or(api_version);
    format!("general{major}")
}

/// Sign the websocket URL `{base}/{api_version}/chat` at `date`
pub fn signed_url(
    base: &str,
    api_version: &str,
    api_key: &str,
    api_secret: &str,
    date: DateTime<Utc>,
) -> RelayResult<String> {
    let endpoint = format!("{}/{api_version}/chat", base.trim_end_matches('/'));
    let url = Url::parse(&endpoint)
        .map_err(|e| RelayError::channel_config(format!("invalid xunfei URL {endpoint}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::channel_config(format!("xunfei URL has no host: {endpoint}")))?;

    let date = date.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let canonical = format!("host: {host}\ndate: {date}\nGET {} HTTP/1.1", url.path());

    let mut mac = Hmac::<Sha256>::new_from_slice(api_secret.as_bytes())
        .map_err(|e| RelayError::internal(format!("invalid xunfei signing key: {e}")))?;
    mac.update(canonical.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let authorization = STANDARD.encode(format!(
        "hmac username=\"{api_key}\", algorithm=\"hmac-sha256\", headers=\"host date request-line\", signature=\"{signature}\""
    ));

    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("authorization", &authorization)
        .append_pair("date", &date)
        .append_pair("host", host)
        .finish();
    Ok(format!("{endpoint}?{query}"))
}

#[derive(Debug, Serialize)]
struct SparkRequest {
    header: SparkRequestHeader,
    parameter: SparkParameter,
    payload: SparkRequestPayload,
}

#[derive(Debug, Serialize)]
struct SparkRequestHeader {
    app_id: String,
}

#[derive(Debug, Serialize)]
struct SparkParameter {
    chat: SparkChatParameter,
}

#[derive(Debug, Serialize)]
struct SparkChatParameter {
    domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SparkRequestPayload {
    message: SparkMessages,
}

#[derive(Debug, Serialize)]
struct SparkMessages {
    text: Vec<SparkMessage>,
}

#[derive(Debug, Serialize)]
struct SparkMessage {
    role: &'static str,
    content: String,
}

impl SparkRequest {
    fn from_chat(request: &ChatCompletionRequest, app_id: &str, domain: String) -> Self {
        let text = request
            .messages
            .iter()
            .map(|message| SparkMessage {
                // Spark only knows system, user and assistant turns
                role: match message.role {
                    MessageRole::System | MessageRole::Developer => "system",
                    MessageRole::Assistant => "assistant",
                    MessageRole::User | MessageRole::Tool | MessageRole::Function => "user",
                },
                content: message.text_content(),
            })
            .collect();

        Self {
            header: SparkRequestHeader {
                app_id: app_id.to_string(),
            },
            parameter: SparkParameter {
                chat: SparkChatParameter {
                    domain,
                    temperature: request.temperature,
                    max_tokens: request.max_tokens,
                },
            },
            payload: SparkRequestPayload {
                message: SparkMessages { text },
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SparkFrame {
    #[serde(default)]
    header: XunfeiHeader,
    #[serde(default)]
    payload: SparkPayload,
}

#[derive(Debug, Default, Deserialize)]
struct SparkPayload {
    #[serde(default)]
    choices: SparkChoices,
    #[serde(default)]
    usage: Option<SparkUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct SparkChoices {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    text: Vec<SparkText>,
}

#[derive(Debug, Default, Deserialize)]
struct SparkText {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct SparkUsage {
    #[serde(default)]
    text: Usage,
}

impl SparkFrame {
    fn error(&self) -> Option<OpenAIError> {
        (self.header.code != 0).then(|| {
            OpenAIError::new(
                self.header.message.clone(),
                "xunfei_error",
                ErrorCode::Int(self.header.code),
            )
        })
    }

    fn is_final(&self) -> bool {
        self.header.status == FINAL_STATUS || self.payload.choices.status == FINAL_STATUS
    }

    fn into_chunk(self, model: &str) -> ChatCompletionChunk {
        let finish_reason = self.is_final().then(|| "stop".to_string());
        let content: String = self
            .payload
            .choices
            .text
            .into_iter()
            .map(|t| t.content)
            .collect();
        let mut chunk = ChatCompletionChunk::delta(
            format!("chatcmpl-{}", self.header.sid),
            model,
            content,
            finish_reason,
        );
        chunk.usage = self.payload.usage.map(|u| u.text);
        chunk
    }
}

fn socket_error(err: WsError) -> RelayError {
    RelayError::stream(format!("Spark websocket failed: {err}"))
}

/// Map a failed handshake, reading the rejection body when there is one
fn handshake_error(err: WsError) -> RelayError {
    match err {
        WsError::Http(response) => {
            let status =
                StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.body().as_deref().unwrap_or_default();
            normalize_error(status, body, xunfei_error)
        }
        other => RelayError::transport(format!("Spark websocket connect failed: {other}")),
    }
}

/// Next reply frame, or `None` once the upstream closed
async fn next_frame(socket: &mut Socket) -> RelayResult<Option<SparkFrame>> {
    while let Some(message) = socket.next().await {
        let text = match message.map_err(socket_error)? {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes)
                .map_err(|e| RelayError::stream(format!("Spark frame is not UTF-8: {e}")))?,
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        let frame: SparkFrame = serde_json::from_str(&text)
            .map_err(|e| RelayError::stream(format!("invalid Spark frame: {e}")))?;
        if let Some(error) = frame.error() {
            return Err(body_error(error));
        }
        return Ok(Some(frame));
    }
    Ok(None)
}

/// Adaptor for Xunfei Spark
pub struct XunfeiAdaptor {
    channel: Channel,
    app_id: String,
    api_key: String,
    api_secret: SecretString,
    requester: Arc<HttpRequester>,
}

impl XunfeiAdaptor {
    /// Create an adaptor for `channel`
    #[must_use]
    pub fn new(
        channel: Channel,
        app_id: String,
        api_key: String,
        api_secret: SecretString,
        requester: Arc<HttpRequester>,
    ) -> Self {
        Self {
            channel,
            app_id,
            api_key,
            api_secret,
            requester,
        }
    }

    /// Application ID sent in the Spark frame header
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn api_version(&self) -> &str {
        self.channel
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_API_VERSION)
    }

    /// Connect, send the request frame and wait for the first reply.
    ///
    /// Handshake failures and an error in the first frame surface here, before
    /// the caller commits to a response.
    async fn open(&self, request: &ChatCompletionRequest) -> RelayResult<(Socket, SparkFrame)> {
        let url = self.full_request_url("chat", &request.model).await?;
        if self.channel.proxy.as_deref().is_some_and(|p| !p.is_empty()) {
            warn!(channel_id = self.channel.id, "Channel proxy is not applied to the Spark websocket");
        }
        debug!(channel_id = self.channel.id, api_version = self.api_version(), "Opening Spark websocket");

        let timeout = self.requester.timeout();
        let (mut socket, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| RelayError::Timeout { timeout })?
            .map_err(handshake_error)?;

        let frame = SparkRequest::from_chat(request, &self.app_id, domain(self.api_version()));
        let frame = serde_json::to_string(&frame)
            .map_err(|e| RelayError::internal(format!("failed to encode Spark request: {e}")))?;
        socket.send(Message::Text(frame)).await.map_err(socket_error)?;

        let first = tokio::time::timeout(timeout, next_frame(&mut socket))
            .await
            .map_err(|_| RelayError::Timeout { timeout })??
            .ok_or_else(|| RelayError::stream("Spark closed the connection before replying"))?;
        Ok((socket, first))
    }
}

impl std::fmt::Debug for XunfeiAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XunfeiAdaptor")
            .field("channel_id", &self.channel.id)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Adaptor for XunfeiAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Xunfei
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Authentication lives in the URL
    async fn request_headers(&self, _headers: &mut HeaderMap) -> RelayResult<()> {
        Ok(())
    }

    async fn full_request_url(&self, _path: &str, _model: &str) -> RelayResult<String> {
        signed_url(
            &self.channel.base_url(),
            self.api_version(),
            &self.api_key,
            self.api_secret.expose_secret(),
            Utc::now(),
        )
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        xunfei_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapability for XunfeiAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let mut stream = self.chat_completion_stream(request).await?;
        let mut id = String::new();
        let mut content = String::new();
        let mut finish_reason = None;
        let mut usage = Usage::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            id = chunk.id;
            if let Some(choice) = chunk.choices.into_iter().next() {
                content.push_str(choice.delta.content.as_deref().unwrap_or_default());
                finish_reason = choice.finish_reason.or(finish_reason);
            }
            if let Some(reported) = chunk.usage {
                usage = reported;
            }
        }

        Ok(ChatCompletionResponse::single(
            id,
            &request.model,
            content,
            finish_reason,
            usage,
        ))
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let (mut socket, first) = self.open(request).await?;
        let model = request.model.clone();

        Ok(EventStream::spawn(async_stream::try_stream! {
            let mut frame = Some(first);
            let mut finished = false;
            while let Some(current) = frame.take() {
                finished = current.is_final();
                yield current.into_chunk(&model);
                if finished {
                    break;
                }
                frame = next_frame(&mut socket).await?;
            }
            if !finished {
                Err(RelayError::stream("Spark closed the connection before the final frame"))?;
            }
            let _ = socket.close(None).await;
        }))
    }
}
