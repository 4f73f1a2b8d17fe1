//! # Relay Telemetry
//!
//! Observability for the LLM relay:
//! - Structured logging with `tracing`, pretty or JSON output
//! - Prometheus metrics for requests, upstream attempts, retries and quota

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LoggingConfig, LoggingError};
pub use metrics::{AttemptOutcome, MetricsError, RelayMetrics};
