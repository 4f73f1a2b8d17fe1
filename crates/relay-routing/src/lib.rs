//! # Relay Routing
//!
//! Channel selection for the LLM relay.
//!
//! This crate provides:
//! - A group → model → priority tier index, swapped atomically on refresh
//! - Weighted random selection within the highest selectable tier
//! - Exclusion and only-chat filters for the retry loop
//! - In-memory, time-boxed channel cooldowns

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cooldown;
pub mod index;
pub mod selector;

// Re-export main types
pub use cooldown::Cooldowns;
pub use index::ChannelIndex;
pub use selector::{bootstrap, ChannelSelector, SelectFilter};
