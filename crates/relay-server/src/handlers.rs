//! HTTP request handlers for the relay API.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderName},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use relay_core::{
    BinaryResponse, ChatCompletionRequest, CompletionRequest, EmbeddingRequest, EmbeddingResponse,
    ImageRequest, ImageResponse, ModelList, ModelObject, ModerationRequest, ModerationResponse,
    SpeechRequest,
};
use relay_engine::{RelayOutput, SseStream};
use serde::Serialize;
use std::convert::Infallible;
use tracing::instrument;

use crate::{
    error::ApiError,
    extractors::{Form, JsonBody, Relay},
    state::AppState,
};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Channels in the routing index
    pub channels: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        channels: state.engine.selector().snapshot().len(),
    })
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().gather(),
    )
}

fn relay_response(output: RelayOutput) -> Response {
    match output {
        RelayOutput::Json(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        RelayOutput::Stream(stream) => sse_response(stream),
    }
}

fn sse_response(stream: SseStream) -> Response {
    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

fn binary_response(response: BinaryResponse) -> Response {
    ([(header::CONTENT_TYPE, response.content_type)], response.body).into_response()
}

/// `POST /v1/chat/completions`
#[instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    JsonBody(request): JsonBody<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let output = state.engine.chat(&ctx, request).await?;
    Ok(relay_response(output))
}

/// `POST /v1/completions`
#[instrument(skip_all)]
pub async fn completions(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    JsonBody(request): JsonBody<CompletionRequest>,
) -> Result<Response, ApiError> {
    let output = state.engine.completion(&ctx, request).await?;
    Ok(relay_response(output))
}

/// `POST /v1/embeddings`
#[instrument(skip_all)]
pub async fn embeddings(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    JsonBody(request): JsonBody<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    Ok(Json(state.engine.embeddings(&ctx, request).await?))
}

/// `POST /v1/engines/{model}/embeddings`; the path names the model
#[instrument(skip_all)]
pub async fn engine_embeddings(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Relay(ctx): Relay,
    JsonBody(mut request): JsonBody<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    request.model = model;
    Ok(Json(state.engine.embeddings(&ctx, request).await?))
}

/// `POST /v1/moderations`
#[instrument(skip_all)]
pub async fn moderations(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    JsonBody(request): JsonBody<ModerationRequest>,
) -> Result<Json<ModerationResponse>, ApiError> {
    Ok(Json(state.engine.moderation(&ctx, request).await?))
}

/// `POST /v1/audio/speech`
#[instrument(skip_all)]
pub async fn speech(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    JsonBody(request): JsonBody<SpeechRequest>,
) -> Result<Response, ApiError> {
    Ok(binary_response(state.engine.speech(&ctx, request).await?))
}

/// `POST /v1/audio/transcriptions`
#[instrument(skip_all)]
pub async fn transcriptions(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    form: Form,
) -> Result<Response, ApiError> {
    let request = form.into_audio()?;
    Ok(binary_response(state.engine.transcription(&ctx, request).await?))
}

/// `POST /v1/audio/translations`
#[instrument(skip_all)]
pub async fn translations(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    form: Form,
) -> Result<Response, ApiError> {
    let request = form.into_audio()?;
    Ok(binary_response(state.engine.translation(&ctx, request).await?))
}

/// `POST /v1/images/generations`
#[instrument(skip_all)]
pub async fn image_generations(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    JsonBody(request): JsonBody<ImageRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    Ok(Json(state.engine.image_generation(&ctx, request).await?))
}

/// `POST /v1/images/edits`
#[instrument(skip_all)]
pub async fn image_edits(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    form: Form,
) -> Result<Json<ImageResponse>, ApiError> {
    let request = form.into_image_edit()?;
    Ok(Json(state.engine.image_edit(&ctx, request).await?))
}

/// `POST /v1/images/variations`
#[instrument(skip_all)]
pub async fn image_variations(
    State(state): State<AppState>,
    Relay(ctx): Relay,
    form: Form,
) -> Result<Json<ImageResponse>, ApiError> {
    let request = form.into_image_edit()?;
    Ok(Json(state.engine.image_variation(&ctx, request).await?))
}

/// `GET /v1/models`: models routable for the caller's group
pub async fn list_models(State(state): State<AppState>, Relay(ctx): Relay) -> Json<ModelList> {
    Json(state.engine.models(ctx.group()))
}

/// `GET /v1/models/{model}`
pub async fn retrieve_model(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Relay(ctx): Relay,
) -> Result<Json<ModelObject>, ApiError> {
    Ok(Json(state.engine.model(ctx.group(), &model)?))
}
