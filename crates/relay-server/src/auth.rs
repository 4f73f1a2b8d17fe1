//! Token authentication.
//!
//! Callers present `Authorization: Bearer <key>`. The key is resolved through
//! the datastore and the matching [`ApiToken`] is attached to the request
//! extensions for [`crate::extractors::Relay`].

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use relay_core::{ApiToken, Datastore, RelayError};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

/// Bearer key from the `Authorization` header
#[must_use]
pub fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let key = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!key.is_empty()).then_some(key)
}

/// Resolve a key to a usable token
pub async fn authenticate(store: &dyn Datastore, key: Option<&str>) -> Result<ApiToken, ApiError> {
    let key = key.ok_or_else(|| ApiError::unauthorized("No API key provided"))?;
    let token = store
        .get_token_by_key(key)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid API key"))?;
    if !token.is_usable() {
        return Err(RelayError::authentication(format!("Token {} is disabled or expired", token.name)).into());
    }
    Ok(token)
}

/// Authentication middleware for the `/v1` routes
pub async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let key = bearer_key(request.headers()).map(ToString::to_string);
    match authenticate(state.engine.store().as_ref(), key.as_deref()).await {
        Ok(token) => {
            debug!(token_id = token.id, user_id = token.user_id, group = %token.group, "Request authenticated");
            request.extensions_mut().insert(token);
            next.run(request).await
        }
        Err(err) => {
            warn!(error = %err, path = %request.uri().path(), "Authentication failed");
            err.into_response()
        }
    }
}
