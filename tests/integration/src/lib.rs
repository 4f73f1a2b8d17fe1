//! End-to-end tests for the LLM relay
//!
//! Each test boots a full relay (config, datastore, engine, HTTP server) on a
//! free port and drives it over HTTP against wiremock upstreams:
//! - API surface: auth, errors, models, metrics
//! - Relay flows: buffered, streamed, billed
//! - Channel routing: priority, failover, auto-disable, pinning
//! - Provider translation
//! - Response cache

pub mod fixtures;
pub mod helpers;
pub mod mock_providers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_providers::*;

#[cfg(test)]
mod api_tests;
#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod provider_tests;
#[cfg(test)]
mod routing_tests;
