//! Route definitions for the relay API.

use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};

use crate::{auth::auth_middleware, handlers, middleware, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .nest("/v1", openai_routes(state.clone()))
        .layer(from_fn_with_state(state.clone(), middleware::metrics_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::cors_layer())
        .with_state(state)
}

/// OpenAI-compatible API routes, all behind token auth
fn openai_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/embeddings", post(handlers::embeddings))
        .route("/engines/:model/embeddings", post(handlers::engine_embeddings))
        .route("/moderations", post(handlers::moderations))
        .route("/audio/speech", post(handlers::speech))
        .route("/audio/transcriptions", post(handlers::transcriptions))
        .route("/audio/translations", post(handlers::translations))
        .route("/images/generations", post(handlers::image_generations))
        .route("/images/edits", post(handlers::image_edits))
        .route("/images/variations", post(handlers::image_variations))
        .route("/models", get(handlers::list_models))
        .route("/models/:model", get(handlers::retrieve_model))
        .route_layer(from_fn_with_state(state, auth_middleware))
}
