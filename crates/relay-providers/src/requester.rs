//! Shared HTTP transport.
//!
//! One pooled [`reqwest::Client`] serves every channel without a proxy
//! override; channels with their own proxy get a lazily built client cached per
//! proxy URL. Non-success statuses are normalized here, through the adaptor's
//! error handler, so adaptors only deal with successful bodies.

use bytes::BytesMut;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use http::StatusCode;
use relay_core::{
    BinaryResponse, EventStream, OpenAIError, OpenAIErrorEnvelope, RelayError, RelayResult,
};
use reqwest::{Client, Proxy, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Provider-specific error body decoder
pub type ErrorHandler = fn(StatusCode, &[u8]) -> Option<OpenAIError>;

/// Transport settings
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    /// Overall request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Global outbound proxy (http, https or socks5)
    pub proxy: Option<String>,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            proxy: None,
        }
    }
}

impl RequesterConfig {
    /// Set the overall timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the global proxy
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

/// Connection-pooled HTTP requester shared by all adaptors
pub struct HttpRequester {
    config: RequesterConfig,
    default_client: Client,
    proxied: DashMap<String, Client>,
}

impl HttpRequester {
    /// Create a requester
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: RequesterConfig) -> RelayResult<Self> {
        let default_client = build_client(&config, config.proxy.as_deref())?;
        Ok(Self {
            config,
            default_client,
            proxied: DashMap::new(),
        })
    }

    /// Configured overall timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Client for a channel; a channel proxy overrides the global one
    pub fn client(&self, proxy: Option<&str>) -> RelayResult<Client> {
        let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(self.default_client.clone());
        };

        if let Some(client) = self.proxied.get(proxy) {
            return Ok(client.clone());
        }

        let client = build_client(&self.config, Some(proxy))?;
        self.proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    /// Send a request; failure statuses become [`RelayError::Upstream`]
    pub async fn send(&self, request: RequestBuilder, handler: ErrorHandler) -> RelayResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if is_failure_status(response.status()) {
            return Err(error_from_response(response, handler).await);
        }
        Ok(response)
    }

    /// Send a request and decode a JSON body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        handler: ErrorHandler,
    ) -> RelayResult<T> {
        let response = self.send(request, handler).await?;
        let body = response.bytes().await.map_err(|e| self.transport_error(&e))?;
        serde_json::from_slice(&body).map_err(|e| {
            RelayError::transport(format!("failed to decode upstream response: {e}"))
        })
    }

    /// Send a request and keep the raw body
    pub async fn send_binary(
        &self,
        request: RequestBuilder,
        handler: ErrorHandler,
    ) -> RelayResult<BinaryResponse> {
        let response = self.send(request, handler).await?;
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(|e| self.transport_error(&e))?;
        Ok(BinaryResponse { content_type, body })
    }

    /// Send a streaming request whose body is framed by the caller.
    ///
    /// A success status with a JSON content type is an error body, not a stream.
    pub async fn open_stream(&self, request: RequestBuilder, handler: ErrorHandler) -> RelayResult<Response> {
        let response = self.send(request, handler).await?;
        if is_json(&response) {
            return Err(error_from_response(response, handler).await);
        }
        Ok(response)
    }

    /// Open a server-sent-events stream and split it into `data:` payloads.
    ///
    /// Returns once the upstream accepted the request, so status and connect
    /// failures surface before the caller commits to streaming. Any
    /// non-JSON content type is read as SSE.
    pub async fn sse_lines(
        &self,
        request: RequestBuilder,
        handler: ErrorHandler,
    ) -> RelayResult<impl Stream<Item = RelayResult<String>> + Send + 'static> {
        let response = self.open_stream(request, handler).await?;
        trace!(status = %response.status(), "Upstream stream opened");
        Ok(data_lines(response.bytes_stream()))
    }

    /// Map a client error, distinguishing timeouts
    #[must_use]
    pub fn transport_error(&self, err: &reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::Timeout {
                timeout: self.config.timeout,
            }
        } else {
            RelayError::transport(err.to_string())
        }
    }
}

impl std::fmt::Debug for HttpRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequester")
            .field("config", &self.config)
            .field("proxied_clients", &self.proxied.len())
            .finish()
    }
}

fn build_client(config: &RequesterConfig, proxy: Option<&str>) -> RelayResult<Client> {
    let mut builder = Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(100);

    if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
        let proxy = Proxy::all(proxy)
            .map_err(|e| RelayError::channel_config(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| RelayError::internal(format!("Failed to create HTTP client: {e}")))
}

/// Statuses outside `[200, 400)` are failures
#[must_use]
pub fn is_failure_status(status: StatusCode) -> bool {
    status.as_u16() < 200 || status.as_u16() >= 400
}

/// Generic error used when a failure body cannot be decoded
#[must_use]
pub fn bad_status_error(status: StatusCode) -> OpenAIError {
    OpenAIError::new(
        format!("bad response status code {}", status.as_u16()),
        "upstream_error",
        "bad_response_status_code",
    )
    .with_param(status.as_u16().to_string())
}

/// Normalize a failure body.
///
/// An error decoded from a success status is reported as 500 so it goes
/// through retry classification like any other upstream failure.
#[must_use]
pub fn normalize_error(status: StatusCode, body: &[u8], handler: ErrorHandler) -> RelayError {
    let error = handler(status, body)
        .filter(|e| !e.message.is_empty())
        .unwrap_or_else(|| bad_status_error(status));
    body_status_error(status, error)
}

/// Error found inside a response body (`base_resp`, `error_code` envelopes)
#[must_use]
pub fn body_error(error: OpenAIError) -> RelayError {
    RelayError::upstream(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), error)
}

fn body_status_error(status: StatusCode, error: OpenAIError) -> RelayError {
    if is_failure_status(status) {
        RelayError::upstream(status.as_u16(), error)
    } else {
        body_error(error)
    }
}

async fn error_from_response(response: Response, handler: ErrorHandler) -> RelayError {
    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(status = %status, error = %e, "Failed to read upstream error body");
            bytes::Bytes::new()
        }
    };
    debug!(status = %status, body = %String::from_utf8_lossy(&body), "Upstream returned an error");
    normalize_error(status, &body, handler)
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"))
}

/// Split a byte stream into the payloads of its `data:` lines.
///
/// Blank lines and other SSE fields are skipped; `[DONE]` is passed through
/// for the adaptor to interpret. A transport error ends the stream.
pub fn data_lines<S, B, E>(body: S) -> impl Stream<Item = RelayResult<String>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::try_stream! {
        let mut body = Box::pin(body);
        let mut buffer = BytesMut::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RelayError::stream(e.to_string()))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                if let Some(data) = parse_data_line(&line) {
                    yield data;
                }
            }
        }

        if let Some(data) = parse_data_line(&buffer) {
            yield data;
        }
    }
}

/// Decode JSON stream payloads into `T`.
///
/// `[DONE]` ends the stream, an `{"error":{..}}` payload ends it with that
/// error, and payloads that do not decode are logged and skipped.
pub fn json_events<T, S>(lines: S) -> EventStream<T>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = RelayResult<String>> + Send + 'static,
{
    EventStream::spawn(async_stream::try_stream! {
        let mut lines = Box::pin(lines);
        while let Some(line) = lines.next().await {
            let line = line?;
            let data = line.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }
            if let Ok(envelope) = serde_json::from_str::<OpenAIErrorEnvelope>(data) {
                Err::<(), _>(body_error(envelope.error))?;
            }
            match serde_json::from_str::<T>(data) {
                Ok(chunk) => yield chunk,
                Err(e) => warn!(error = %e, data = %data, "Failed to parse stream chunk, skipping"),
            }
        }
    })
}

fn parse_data_line(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).to_string())
}
