//! Request middleware: request ids, metrics and CORS.

use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::error::{ApiError, RenderedError};
use crate::extractors::RequestId;
use crate::state::AppState;

/// Response header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Assign a request id, echo it back and stamp it onto error messages
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_headers(request.headers());
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;

    if let Some(RenderedError(error)) = response.extensions().get::<RenderedError>().cloned() {
        let status = response.status();
        response = (status, Json(ApiError::envelope(&error, Some(&request_id.0)))).into_response();
    }
    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Record request count and latency per matched route
pub async fn metrics_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let method = request.method().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed = started.elapsed();
    state.metrics().record_request(&endpoint, status.as_u16(), elapsed);

    let millis = elapsed.as_millis();
    if status.is_server_error() {
        warn!(%method, endpoint = %endpoint, status = status.as_u16(), millis, "Request failed");
    } else if endpoint.starts_with("/v1") {
        info!(%method, endpoint = %endpoint, status = status.as_u16(), millis, "Request completed");
    } else {
        debug!(%method, endpoint = %endpoint, status = status.as_u16(), millis, "Request completed");
    }
    response
}

/// CORS for browser clients of the OpenAI-compatible API
#[must_use]
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
}
