//! # MiniMax Adaptor
//!
//! abab models through the `chatcompletion_pro` API.
//!
//! - The `api_key|group_id` key yields a Bearer token and the `GroupId`
//!   query parameter
//! - System prompts become `bot_setting` entries; replies are constrained to
//!   the `assistant` bot
//! - Every body carries `base_resp`; a non-zero `status_code` is an error even
//!   on HTTP 200
//! - Usage reports only `total_tokens`, so usage is returned with zero prompt
//!   tokens and the relay splits it against its own prompt estimate

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
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::requester::{body_error, HttpRequester};

const CHAT_PATH: &str = "/text/chatcompletion_pro";
const EMBEDDINGS_PATH: &str = "/embeddings";

const BOT_NAME: &str = "assistant";
const DEFAULT_BOT_PROMPT: &str = "You are a helpful assistant. You can help me by answering my questions. You can also ask me questions.";

#[derive(Debug, Default, Deserialize)]
struct BaseResp {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    status_msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct BaseRespEnvelope {
    #[serde(default)]
    base_resp: BaseResp,
}

impl BaseResp {
    fn into_openai(self) -> Option<OpenAIError> {
        (self.status_code != 0)
            .then(|| OpenAIError::new(self.status_msg, "minimax_error", self.status_code))
    }

    fn check(self) -> RelayResult<()> {
        self.into_openai().map_or(Ok(()), |error| Err(body_error(error)))
    }
}

/// Decode the `base_resp` status carried by every MiniMax body
pub fn minimax_error(_status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
    serde_json::from_slice::<BaseRespEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.base_resp.into_openai())
}

#[derive(Debug, Serialize)]
struct MiniMaxMessage {
    sender_type: &'static str,
    sender_name: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct BotSetting {
    bot_name: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MiniMaxChatRequest {
    model: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tokens_to_generate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    messages: Vec<MiniMaxMessage>,
    bot_setting: Vec<BotSetting>,
    reply_constraints: Value,
}

impl MiniMaxChatRequest {
    fn from_chat(request: &ChatCompletionRequest, stream: bool) -> Self {
        let mut bot_setting = Vec::new();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            let text = message.text_content();
            let (sender_type, sender_name) = match message.role {
                MessageRole::System | MessageRole::Developer => {
                    bot_setting.push(BotSetting {
                        bot_name: BOT_NAME,
                        content: text,
                    });
                    continue;
                }
                MessageRole::Assistant => ("BOT", BOT_NAME),
                MessageRole::Tool | MessageRole::Function => ("FUNCTION", BOT_NAME),
                MessageRole::User => ("USER", "user"),
            };
            if text.is_empty() {
                continue;
            }
            messages.push(MiniMaxMessage {
                sender_type,
                sender_name,
                text,
            });
        }

        if bot_setting.is_empty() {
            bot_setting.push(BotSetting {
                bot_name: BOT_NAME,
                content: DEFAULT_BOT_PROMPT.to_string(),
            });
        }

        Self {
            model: request.model.clone(),
            stream,
            tokens_to_generate: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            messages,
            bot_setting,
            reply_constraints: json!({ "sender_type": "BOT", "sender_name": BOT_NAME }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyChoice {
    #[serde(default)]
    messages: Vec<ReplyMessage>,
    #[serde(default)]
    finish_reason: String,
}

impl ReplyChoice {
    fn text(&self) -> &str {
        self.messages.first().map_or("", |m| m.text.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct TotalUsage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MiniMaxChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    #[serde(default)]
    usage: Option<TotalUsage>,
    #[serde(default)]
    base_resp: BaseResp,
}

impl MiniMaxChatResponse {
    fn usage(&self) -> Option<Usage> {
        self.usage.as_ref().map(|u| Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: u.total_tokens,
        })
    }
}

/// `max_output` is MiniMax's length stop
fn finish_reason(reason: &str) -> String {
    match reason {
        "max_output" => "length".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct MiniMaxEmbeddingResponse {
    #[serde(default)]
    vectors: Vec<Value>,
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    base_resp: BaseResp,
}

/// Adaptor for MiniMax
pub struct MiniMaxAdaptor {
    channel: Channel,
    api_key: SecretString,
    group_id: String,
    requester: Arc<HttpRequester>,
}

impl MiniMaxAdaptor {
    /// Create an adaptor for `channel`
    #[must_use]
    pub fn new(
        channel: Channel,
        api_key: SecretString,
        group_id: String,
        requester: Arc<HttpRequester>,
    ) -> Self {
        Self {
            channel,
            api_key,
            group_id,
            requester,
        }
    }

    async fn post(&self, path: &str, model: &str) -> RelayResult<RequestBuilder> {
        let url = self.full_request_url(path, model).await?;
        let mut headers = HeaderMap::new();
        self.request_headers(&mut headers).await?;
        debug!(channel_id = self.channel.id, url = %url, "Dispatching MiniMax request");
        Ok(self
            .requester
            .client(self.channel.proxy.as_deref())?
            .post(url)
            .headers(headers))
    }
}

impl std::fmt::Debug for MiniMaxAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniMaxAdaptor")
            .field("channel_id", &self.channel.id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Adaptor for MiniMaxAdaptor {
    fn provider_type(&self) -> ProviderType {
        ProviderType::MiniMax
    }

    fn channel(&self) -> &Channel {
        &self.channel
    }

    async fn request_headers(&self, headers: &mut HeaderMap) -> RelayResult<()> {
        let value = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
            .map_err(|_| RelayError::channel_config("channel key contains invalid header characters"))?;
        headers.insert(http::header::AUTHORIZATION, value);
        Ok(())
    }

    async fn full_request_url(&self, path: &str, _model: &str) -> RelayResult<String> {
        let path = if path.ends_with("embeddings") {
            EMBEDDINGS_PATH
        } else {
            CHAT_PATH
        };
        Ok(format!(
            "{}{path}?GroupId={}",
            self.channel.base_url(),
            self.group_id
        ))
    }

    fn error_handle(&self, status: StatusCode, body: &[u8]) -> Option<OpenAIError> {
        minimax_error(status, body)
    }

    fn chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }

    fn embeddings(&self) -> Option<&dyn EmbeddingCapability> {
        Some(self)
    }
}

#[async_trait]
impl ChatCapability for MiniMaxAdaptor {
    async fn chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<ChatCompletionResponse> {
        let body = MiniMaxChatRequest::from_chat(request, false);
        let builder = self.post("chat", &request.model).await?.json(&body);
        let response: MiniMaxChatResponse = self.requester.send_json(builder, minimax_error).await?;
        let usage = response.usage();
        response.base_resp.check()?;

        let choice = response.choices.first();
        Ok(ChatCompletionResponse::single(
            response.id,
            &request.model,
            choice.map_or("", ReplyChoice::text),
            choice
                .filter(|c| !c.finish_reason.is_empty())
                .map(|c| finish_reason(&c.finish_reason)),
            usage.unwrap_or_default(),
        ))
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> RelayResult<EventStream<ChatCompletionChunk>> {
        let body = MiniMaxChatRequest::from_chat(request, true);
        let builder = self.post("chat", &request.model).await?.json(&body);
        let lines = self.requester.sse_lines(builder, minimax_error).await?;
        let model = request.model.clone();

        Ok(EventStream::spawn(async_stream::try_stream! {
            let mut lines = Box::pin(lines);
            while let Some(line) = lines.next().await {
                let line = line?;
                let chunk = match serde_json::from_str::<MiniMaxChatResponse>(&line) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, data = %line, "Skipping unrecognized MiniMax chunk");
                        continue;
                    }
                };
                let usage = chunk.usage();
                chunk.base_resp.check()?;
                let Some(choice) = chunk.choices.first() else {
                    continue;
                };

                if choice.finish_reason.is_empty() {
                    yield ChatCompletionChunk::delta(&chunk.request_id, &model, choice.text(), None);
                } else {
                    // The final chunk repeats the whole reply; only its stop and usage are new
                    let mut last = ChatCompletionChunk::delta(
                        &chunk.id,
                        &model,
                        "",
                        Some(finish_reason(&choice.finish_reason)),
                    );
                    last.usage = usage;
                    yield last;
                    break;
                }
            }
        }))
    }
}

#[async_trait]
impl EmbeddingCapability for MiniMaxAdaptor {
    async fn embeddings(&self, request: &EmbeddingRequest) -> RelayResult<EmbeddingResponse> {
        let texts: Vec<String> = match &request.input {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let body = json!({ "model": request.model, "texts": texts, "type": "db" });
        let builder = self.post("embeddings", &request.model).await?.json(&body);
        let response: MiniMaxEmbeddingResponse = self.requester.send_json(builder, minimax_error).await?;
        response.base_resp.check()?;

        let data = response
            .vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| json!({ "object": "embedding", "embedding": embedding, "index": index }))
            .collect();
        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data,
            model: request.model.clone(),
            usage: Usage::new(response.total_tokens, 0),
        })
    }
}
