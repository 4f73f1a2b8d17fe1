//! # Relay Server
//!
//! OpenAI-compatible HTTP surface for the LLM relay.
//!
//! This crate provides:
//! - Axum routes for chat, completions, embeddings, moderation, audio and images
//! - Bearer token authentication against the datastore
//! - OpenAI error envelopes stamped with the request id
//! - SSE passthrough for streamed completions
//! - Graceful shutdown with a bounded drain

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod state;

#[cfg(test)]
mod testing;

// Re-export main types
pub use auth::auth_middleware;
pub use error::ApiError;
pub use extractors::{JsonBody, Relay, RequestId, PIN_HEADER};
pub use routes::create_router;
pub use server::{Server, ServerError};
pub use shutdown::{shutdown_signal, ShutdownCoordinator, ShutdownPhase};
pub use state::AppState;
