//! Embeddings, moderation, audio and image relays.
//!
//! These families are never streamed and never cached. Each one prices the
//! caller-facing model, runs the failover loop and settles from the usage
//! the upstream reported, falling back to local estimates.

use base64::Engine as _;
use bytes::Bytes;
use relay_billing::image_tokens;
use relay_core::{
    Adaptor, AudioRequest, BinaryResponse, EmbeddingRequest, EmbeddingResponse, ImageEditRequest,
    ImageRequest, ImageResponse, ModerationRequest, ModerationResponse, ObjectStorage, RelayError,
    RelayResult, SpeechRequest, Usage,
};
use std::sync::Arc;
use tracing::warn;

use crate::context::{RelayContext, RelayKind};
use crate::engine::{RelayEngine, Route};

fn unsupported(kind: RelayKind) -> RelayError {
    RelayError::unsupported(kind.action())
}

impl RelayEngine {
    /// Relay `POST /v1/embeddings`
    pub async fn embeddings(&self, ctx: &RelayContext, request: EmbeddingRequest) -> RelayResult<EmbeddingResponse> {
        request.validate()?;
        let prompt_tokens = self.counter.count_text(&request.input_text(), &request.model);
        let route = Route::new(RelayKind::Embeddings, &request.model);

        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let embeddings = adaptor.embeddings().ok_or_else(|| unsupported(RelayKind::Embeddings))?;
                        embeddings.embeddings(&upstream).await
                    }
                },
                |response: &mut EmbeddingResponse| {
                    // Some upstreams send an all-zero usage object
                    if response.usage.prompt_tokens == 0 && response.usage.total_tokens == 0 {
                        response.usage = Usage::new(prompt_tokens, 0);
                    }
                    response.usage
                },
            )
            .await?;
        Ok(attempted.value)
    }

    /// Relay `POST /v1/moderations`
    pub async fn moderation(&self, ctx: &RelayContext, request: ModerationRequest) -> RelayResult<ModerationResponse> {
        request.validate()?;
        let prompt_tokens = self.counter.count_text(&request.input_text(), &request.model);
        let route = Route::new(RelayKind::Moderation, &request.model);

        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let moderation = adaptor.moderation().ok_or_else(|| unsupported(RelayKind::Moderation))?;
                        moderation.moderation(&upstream).await
                    }
                },
                |_: &mut ModerationResponse| Usage::new(prompt_tokens, 0),
            )
            .await?;
        Ok(attempted.value)
    }

    /// Relay `POST /v1/audio/speech`; the prompt is billed per input character
    pub async fn speech(&self, ctx: &RelayContext, request: SpeechRequest) -> RelayResult<BinaryResponse> {
        request.validate()?;
        let prompt_tokens = u32::try_from(request.input.chars().count()).unwrap_or(u32::MAX);
        let route = Route::new(RelayKind::Speech, &request.model);

        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let speech = adaptor.speech().ok_or_else(|| unsupported(RelayKind::Speech))?;
                        speech.speech(&upstream).await
                    }
                },
                |_: &mut BinaryResponse| Usage::new(prompt_tokens, 0),
            )
            .await?;
        Ok(attempted.value)
    }

    /// Relay `POST /v1/audio/transcriptions`
    pub async fn transcription(&self, ctx: &RelayContext, request: AudioRequest) -> RelayResult<BinaryResponse> {
        self.relay_audio(ctx, RelayKind::Transcription, request).await
    }

    /// Relay `POST /v1/audio/translations`
    pub async fn translation(&self, ctx: &RelayContext, request: AudioRequest) -> RelayResult<BinaryResponse> {
        self.relay_audio(ctx, RelayKind::Translation, request).await
    }

    async fn relay_audio(&self, ctx: &RelayContext, kind: RelayKind, request: AudioRequest) -> RelayResult<BinaryResponse> {
        request.validate()?;
        let route = Route::new(kind, &request.model);
        let counter = Arc::clone(&self.counter);

        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                0,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        match kind {
                            RelayKind::Translation => {
                                let translation = adaptor.translation().ok_or_else(|| unsupported(kind))?;
                                translation.translation(&upstream).await
                            }
                            _ => {
                                let transcription = adaptor.transcription().ok_or_else(|| unsupported(kind))?;
                                transcription.transcription(&upstream).await
                            }
                        }
                    }
                },
                |response: &mut BinaryResponse| {
                    Usage::new(0, counter.count_text(&response.transcript_text(), &route.model))
                },
            )
            .await?;
        Ok(attempted.value)
    }

    /// Relay `POST /v1/images/generations`.
    ///
    /// When the caller asked for URLs but the upstream returned base64 and
    /// object storage is configured, images are uploaded and replaced by URLs.
    pub async fn image_generation(&self, ctx: &RelayContext, request: ImageRequest) -> RelayResult<ImageResponse> {
        request.validate()?;
        let quality = request.extra.get("quality").and_then(|v| v.as_str());
        let prompt_tokens = image_tokens(&request.model, request.size.as_deref(), quality, request.count())?;
        let route = Route::new(RelayKind::ImageGeneration, &request.model);

        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        let images = adaptor
                            .image_generation()
                            .ok_or_else(|| unsupported(RelayKind::ImageGeneration))?;
                        images.image_generation(&upstream).await
                    }
                },
                |_: &mut ImageResponse| Usage::new(prompt_tokens, 0),
            )
            .await?;

        let mut response = attempted.value;
        if request.wants_url() {
            if let Some(storage) = &self.storage {
                upload_images(storage.as_ref(), &ctx.request_id, &mut response).await;
            }
        }
        Ok(response)
    }

    /// Relay `POST /v1/images/edits`
    pub async fn image_edit(&self, ctx: &RelayContext, request: ImageEditRequest) -> RelayResult<ImageResponse> {
        self.relay_image_edit(ctx, RelayKind::ImageEdit, request).await
    }

    /// Relay `POST /v1/images/variations`
    pub async fn image_variation(&self, ctx: &RelayContext, request: ImageEditRequest) -> RelayResult<ImageResponse> {
        self.relay_image_edit(ctx, RelayKind::ImageVariation, request).await
    }

    async fn relay_image_edit(
        &self,
        ctx: &RelayContext,
        kind: RelayKind,
        request: ImageEditRequest,
    ) -> RelayResult<ImageResponse> {
        request.validate(kind == RelayKind::ImageEdit)?;
        let size = request
            .fields
            .iter()
            .find(|(k, _)| k == "size")
            .map(|(_, v)| v.as_str());
        let prompt_tokens = image_tokens(&request.model, size, None, request.count())?;
        let route = Route::new(kind, &request.model);

        let attempted = self
            .relay_buffered(
                ctx,
                &route,
                prompt_tokens,
                |adaptor: Arc<dyn Adaptor>, model| {
                    let mut upstream = request.clone();
                    upstream.model = model;
                    async move {
                        match kind {
                            RelayKind::ImageVariation => {
                                let variation = adaptor.image_variation().ok_or_else(|| unsupported(kind))?;
                                variation.image_variation(&upstream).await
                            }
                            _ => {
                                let edit = adaptor.image_edit().ok_or_else(|| unsupported(kind))?;
                                edit.image_edit(&upstream).await
                            }
                        }
                    }
                },
                |_: &mut ImageResponse| Usage::new(prompt_tokens, 0),
            )
            .await?;
        Ok(attempted.value)
    }
}

async fn upload_images(storage: &dyn ObjectStorage, request_id: &str, response: &mut ImageResponse) {
    for image in &mut response.data {
        if image.url.is_some() {
            continue;
        }
        let Some(encoded) = image.b64_json.as_deref() else {
            continue;
        };
        let data = match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(request_id, error = %e, "Image payload is not valid base64");
                continue;
            }
        };
        let filename = format!("{}.png", uuid::Uuid::new_v4());
        match storage.upload(data, &filename).await {
            Ok(url) => {
                image.url = Some(url);
                image.b64_json = None;
            }
            Err(e) => warn!(request_id, error = %e, "Image upload failed, returning base64"),
        }
    }
}
