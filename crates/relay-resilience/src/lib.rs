//! # Relay Resilience
//!
//! Failure handling for the LLM relay:
//! - Failover policy: which upstream statuses move a request to another channel
//! - Channel health: fatal error classification, auto-disable and re-enable
//! - Response cache for replaying identical chat and completion requests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod failover;
pub mod health;

// Re-export main types
pub use cache::{
    fingerprint, CacheBackend, CacheError, CachedResponse, MemoryCacheBackend, ResponseCache,
};
pub use failover::{FailoverConfig, FailoverPolicy};
pub use health::{should_disable_channel, should_enable_channel, ChannelHealth, HealthConfig};
