//! # Relay Billing
//!
//! Quota accounting for the LLM relay.
//!
//! This crate provides:
//! - A model pricing table with exact and trailing-`*` entries plus group ratios
//! - A heuristic prompt/completion token estimator
//! - Two-phase quota metering: reserve, then settle or refund exactly once

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod counter;
pub mod pricing;
pub mod quota;

// Re-export main types
pub use counter::{image_tokens, EstimatingTokenCounter};
pub use pricing::{ModelPricingTable, PriceQuote, DOLLAR_RATE, QUOTA_PER_UNIT};
pub use quota::{QuotaMeter, QuotaReservation, Settlement};
