//! Custom Axum extractors for the relay.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Multipart, Request},
    http::{request::Parts, HeaderMap},
};
use bytes::Bytes;
use relay_core::{ApiToken, AudioRequest, ChannelId, FileUpload, ImageEditRequest, RelayError};
use relay_engine::RelayContext;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ApiError;

/// Header a caller uses to pin a channel
pub const PIN_HEADER: &str = "x-relay-channel";

/// Request ID from headers, or a fresh one
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    /// Resolve the id for a request: middleware-assigned, then headers, then new
    #[must_use]
    pub fn from_parts(parts: &Parts) -> Self {
        if let Some(id) = parts.extensions.get::<Self>() {
            return id.clone();
        }
        Self::from_headers(&parts.headers)
    }

    /// Read `x-request-id`, `x-correlation-id` or `request-id`
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let id = headers
            .get("x-request-id")
            .or_else(|| headers.get("x-correlation-id"))
            .or_else(|| headers.get("request-id"))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);
        Self(id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts))
    }
}

/// Relay context for an authenticated request
#[derive(Debug, Clone)]
pub struct Relay(pub RelayContext);

#[async_trait]
impl<S> FromRequestParts<S> for Relay
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .extensions
            .get::<ApiToken>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("No API key provided"))?;
        let pinned = pinned_channel(&parts.headers, &token)?;
        let RequestId(request_id) = RequestId::from_parts(parts);

        Ok(Self(
            RelayContext::new(token)
                .with_request_id(request_id)
                .with_pinned_channel(pinned),
        ))
    }
}

/// Channel pinned through [`PIN_HEADER`], ignored unless the token may pin
fn pinned_channel(headers: &HeaderMap, token: &ApiToken) -> Result<Option<ChannelId>, ApiError> {
    let Some(raw) = headers.get(PIN_HEADER) else {
        return Ok(None);
    };
    if !token.allow_channel_pin {
        debug!(token_id = token.id, "Ignoring channel pin from token without permission");
        return Ok(None);
    }
    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<ChannelId>().ok())
        .map(Some)
        .ok_or_else(|| {
            RelayError::validation(
                "X-Relay-Channel must be a channel id",
                Some(PIN_HEADER.to_string()),
                "invalid_channel_id",
            )
            .into()
        })
}

/// JSON body extractor with OpenAI-style rejections
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read request body: {}", e.body_text())))?;

        let value: T = serde_json::from_slice(&bytes).map_err(|e| {
            debug!(error = %e, "JSON parse error");
            ApiError::bad_request(format!("Invalid JSON: {e}"))
        })?;

        Ok(Self(value))
    }
}

/// Multipart form split into uploaded files and text fields
#[derive(Debug, Clone, Default)]
pub struct Form {
    /// `(field name, file)` in arrival order
    pub files: Vec<(String, FileUpload)>,
    /// `(field name, value)` in arrival order
    pub fields: Vec<(String, String)>,
}

#[async_trait]
impl<S> FromRequest<S> for Form
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e.body_text())))?;
        let invalid = |e: axum::extract::multipart::MultipartError| {
            ApiError::bad_request(format!("Invalid multipart body: {e}"))
        };

        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(ToString::to_string);
            if let Some(filename) = filename {
                let content_type = field.content_type().map(ToString::to_string);
                let data = field.bytes().await.map_err(invalid)?;
                form.files.push((
                    name,
                    FileUpload {
                        filename,
                        content_type,
                        data,
                    },
                ));
            } else {
                let value = field.text().await.map_err(invalid)?;
                form.fields.push((name, value));
            }
        }
        Ok(form)
    }
}

impl Form {
    /// Remove a text field; `name[]` matches too
    pub fn take_field(&mut self, name: &str) -> Option<String> {
        let at = self.fields.iter().position(|(k, _)| field_matches(k, name))?;
        Some(self.fields.remove(at).1)
    }

    /// Remove a file; `name[]` matches too
    pub fn take_file(&mut self, name: &str) -> Option<FileUpload> {
        let at = self.files.iter().position(|(k, _)| field_matches(k, name))?;
        Some(self.files.remove(at).1)
    }

    /// Transcription or translation request; `file` is required
    pub fn into_audio(mut self) -> Result<AudioRequest, ApiError> {
        let model = self.take_field("model").unwrap_or_default();
        let file = self.take_file("file").ok_or_else(|| missing_file("file"))?;
        Ok(AudioRequest {
            model,
            file,
            fields: self.fields,
        })
    }

    /// Image edit or variation request; `image` is required
    pub fn into_image_edit(mut self) -> Result<ImageEditRequest, ApiError> {
        let model = self
            .take_field("model")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "dall-e-2".to_string());
        let image = self.take_file("image").ok_or_else(|| missing_file("image"))?;
        let mask = self.take_file("mask");
        let prompt = self.take_field("prompt");
        Ok(ImageEditRequest {
            model,
            image,
            mask,
            prompt,
            fields: self.fields,
        })
    }
}

fn field_matches(key: &str, name: &str) -> bool {
    key == name || key.strip_suffix("[]") == Some(name)
}

fn missing_file(name: &str) -> ApiError {
    RelayError::validation(format!("{name} is required"), Some(name.to_string()), format!("missing_{name}")).into()
}
