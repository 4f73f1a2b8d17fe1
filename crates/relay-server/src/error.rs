//! API error rendering.
//!
//! Every failure leaves the server as an OpenAI error envelope. The request id
//! suffix is appended by [`crate::middleware::request_id_middleware`], which is
//! the only layer that knows the id for every response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_core::{OpenAIError, OpenAIErrorEnvelope, RelayError};

/// Error returned by handlers and extractors
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// OpenAI error body
    pub error: OpenAIError,
}

/// Marker left on error responses so the body can be re-rendered with a request id
#[derive(Debug, Clone)]
pub struct RenderedError(pub OpenAIError);

impl ApiError {
    /// 400 with an `invalid_request_error`
    pub fn bad_request(message: impl Into<String>) -> Self {
        RelayError::validation(message, None, "invalid_request").into()
    }

    /// 401 with an `authentication_error`
    pub fn unauthorized(message: impl Into<String>) -> Self {
        RelayError::authentication(message).into()
    }

    /// 500 with a `relay_error`
    pub fn internal(message: impl Into<String>) -> Self {
        RelayError::internal(message).into()
    }

    /// Envelope with the request id appended to the message
    #[must_use]
    pub fn envelope(error: &OpenAIError, request_id: Option<&str>) -> OpenAIErrorEnvelope {
        let mut error = error.clone();
        if let Some(id) = request_id {
            error.message = format!("{} (request id: {id})", error.message);
        }
        OpenAIErrorEnvelope { error }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            error: err.to_openai_error(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Self::envelope(&self.error, None);
        let mut response = (self.status, Json(body)).into_response();
        response.extensions_mut().insert(RenderedError(self.error));
        response
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.error.message)
    }
}

impl std::error::Error for ApiError {}
