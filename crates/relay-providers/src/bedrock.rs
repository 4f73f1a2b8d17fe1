//! # AWS Bedrock Adaptor
//!
//! Claude models served through Bedrock runtime.
//!
//! - Requests are the Claude Messages payload with
//!   `anthropic_version: bedrock-2023-05-31`; the model is part of the URL
//! - Every request is signed with AWS Signature Version 4
//! - Streams arrive as AWS event-stream frames whose `chunk` events carry a
//!   base64 encoded Claude stream event

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use relay_core::{
    Adaptor, AwsCredential, Channel, ChatCapability, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, EventStream, OpenAIError, ProviderType, RelayError, RelayResult,
};
use reqwest::RequestBuilder;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::anthropic::{ClaudeRequest, ClaudeResponse, ClaudeStreamEvent, ClaudeStreamState};
use crate::eventstream::{self, Message};
use crate::requester::{body_error, HttpRequester};
use crate::sigv4::SigV4Signer;

/// Body version marker Bedrock expects for Claude models
pub const BEDROCK_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

const SERVICE: &str = "bedrock";

/// Caller-facing Claude names and their Bedrock model IDs
const MODEL_IDS: &[(&str, &str)] = &[
    ("claude-instant-1.2", "anthropic.claude-instant-v1"),
    ("claude-2.0", "anthropic.claude-v2"),
    ("claude-2.1", "anthropic.claude-v2:1"),
    ("claude-3-haiku-20240307", "anthropic.claude-3-haiku-20240307-v1:0"),
    ("claude-3-sonnet-20240229", "anthropic.claude-3-sonnet-20240229-v1:0"),
    ("claude-3-opus-20240229", "anthropic.claude-3-opus-20240229-v1:0"),
    ("claude-3-5-sonnet-20240620", "anthropic.claude-3-5-sonnet-20240620-v1:0"),
    ("claude-3-5-sonnet-20241022", "anthropic.claude-3-5-sonnet-20241022-v2:0"),
];

/// Bedrock model ID for `model`; unknown names are used as given
#[must_use]
pub fn model_id(model: &str) -> &str {
    MODEL_IDS
        .iter()
        .find(|(name, _)| *name == model)
        .map_or(model, |(_, id)| *id)
}

#[derive(Debug, Deserialize)]
struct BedrockErrorBody {
    #[serde(default, alias = "Message")]
    message: String,
}

/// Decode Bedrock's `{"message": ...}` error body
pub fn bedrock_error(_status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    serde_json::from_slice::<BedrockErrorBody>(body)
        .ok()
        .filter(|e| !e.message.is_empty())
        .map(|e| OpenAIError::new(e.message, "bedrock_error", "bedrock_error"))
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    bytes: String,
}

/// Adaptor for Claude on AWS Bedrock
pub struct BedrockAdaptor {
    channel: Channel,
    signer: SigV4Signer,
    requester: Arc<HttpRequester>,
}

impl BedrockAdaptor {
    /// Create an adaptor for `channel`
    #[must_use]
    pub fn new(channel: Channel, credential: AwsCredential, requester: Arc<HttpRequester>) -> Self {
        Self {
            channel,
            signer: SigV4Signer::new(credential, SERVICE),
            requester,
        }
    }

    fn base_url(&self) -> String {
        let base = self.channel.base_url();
        if base.is_empty() {
            format!("https://bedrock-runtime.{}.amazonaws.com", self.signer.region())
        } else {
            base
        }
    }

    async fn signed_request(
        &self,
        path: &str,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> RelayResult<RequestBuilder> {
        let mut body = ClaudeRequest::from_chat(request);
        body.model = None;
        body.anthropic_version = Some(BEDROCK_ANTHROPIC_VERSION);
        body.stream = false;
        let payload = serde_json::to_vec(&body)?;

        let raw_url = self.full_request_url(path, &request.model).await?;
        let url = Url::parse(&raw_url)
            .map_err(|e| RelayError::channel_config(format!("invalid bedrock URL {raw_url}: {e}")))?;

        let mut headers = HeaderMap::new();
        self.request_headers(&mut headers).await?;
        if stream {
            headers.insert(
                http::header::ACCEPT,
                HeaderValue::from_static("application/vnd.amazon.eventstream"),
            );
        }
        self.signer
            .sign(&Method::POST, &url, &mut headers, &payload, chrono::Utc::now())?;

        debug!(channel_id = self.channel.id, url = %url, "Dispatching Bedrock request");
        Ok(self
            .requester
            .client(self.channel.proxy.as_deref())?
            .post(url)
            .headers(headers)
            .body(payload))
    }
}

impl std::fmt::Debug for BedrockAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedrockAdaptor")
            .field("channel_id", &self.channel.id)
            .field("region", &self.signer.region())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Adaptor for BedrockAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Bedrock
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Static headers only; the SigV4 signature needs the body and is added
    /// when the request is built
    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()> {
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(http::header::ACCEPT, HeaderValue::from_static("application/json"));
        Ok(())
    }

    async fn full_request_url(&self, path: &str, model: &str) -> RelayResult<String> {
        let action = if path.ends_with("stream") {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        let encoded: String = url::form_urlencoded::byte_serialize(model_id(model).as_bytes()).collect();
        Ok(format!("{}/model/{encoded}/{action}", self.base_url()))
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        bedrock_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapability for BedrockAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let builder = self.signed_request("invoke", request, false).await?;
        let response: ClaudeResponse = self.requester.send_json(builder, bedrock_error).await?;
        response.into_chat(&request.model)
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let builder = self
            .signed_request("invoke-with-response-stream", request, true)
            .await?;
        let response = self.requester.open_stream(builder, bedrock_error).await?;
        let frames = eventstream::messages(response.bytes_stream());
        let mut state = ClaudeStreamState::new(request.model.clone());

        Ok(EventStream::spawn(async_stream::try_stream! {
            let mut frames = Box::pin(frames);
            while let Some(frame) = frames.next().await {
                let Some(event) = decode_frame(&frame?)? else {
                    continue;
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

/// Claude event carried by one frame; `None` for frames without one
fn decode_frame(frame: &Message) -> RelayResult<Option<ClaudeStreamEvent>> {
    match frame.header_str(":message-type").unwrap_or("event") {
        "event" => {
            if frame.header_str(":event-type").is_some_and(|t| t != "chunk") {
                return Ok(None);
            }
            let payload: ChunkPayload = serde_json::from_slice(&frame.payload)
                .map_err(|e| RelayError::stream(format!("invalid bedrock chunk: {e}")))?;
            let raw = base64::engine::general_purpose::STANDARD
                .decode(payload.bytes)
                .map_err(|e| RelayError::stream(format!("invalid bedrock chunk encoding: {e}")))?;
            match serde_json::from_slice::<ClaudeStreamEvent>(&raw) {
                Ok(event) => Ok(Some(event)),
                Err(e) => {
                    warn!(error = %e, "Skipping unrecognized Claude event");
                    Ok(None)
                }
            }
        }
        "exception" => {
            let kind = frame.header_str(":exception-type").unwrap_or("exception");
            let message = serde_json::from_slice::<BedrockErrorBody>(&frame.payload)
                .map(|b| b.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&frame.payload).into_owned());
            Err(body_error(OpenAIError::new(message, "bedrock_error", kind)))
        }
        "error" => {
            let code = frame.header_str(":error-code").unwrap_or("error");
            let message = frame.header_str(":error-message").unwrap_or("bedrock stream error");
            Err(body_error(OpenAIError::new(message, "bedrock_error", code)))
        }
        other => {
            debug!(message_type = %other, "Ignoring bedrock frame");
            Ok(None)
        }
    }
}
