//! # Relay Engine
//!
//! Request orchestration for the LLM relay.
//!
//! This crate provides:
//! - The failover loop: channel selection, adaptor dispatch, retry and cooldown
//! - Quota metering around every relay: reserve, then settle or refund
//! - SSE relaying with usage synthesis and settlement on disconnect
//! - The chat response cache short-circuit
//! - Channel probes and balance refresh

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod engine;
pub mod maintenance;
pub mod media;
pub mod stream;
pub mod text;
pub mod usage;

#[cfg(test)]
mod testing;

// Re-export main types
pub use context::{RelayContext, RelayKind};
pub use engine::{RelayEngine, RelayEngineBuilder, SATURATED_MESSAGE};
pub use maintenance::{spawn_maintenance, SweepReport};
pub use stream::{error_frame, SseStream, DONE_FRAME};
pub use text::RelayOutput;
pub use usage::reconcile_usage;
