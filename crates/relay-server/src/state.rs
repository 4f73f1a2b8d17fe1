//! Shared handler state.

use relay_engine::RelayEngine;
use relay_telemetry::RelayMetrics;
use std::sync::Arc;
use std::time::Instant;

/// State handed to every handler and middleware
#[derive(Debug, Clone)]
pub struct AppState {
    /// Relay engine
    pub engine: Arc<RelayEngine>,
    /// Process start, reported by `/health`
    pub started_at: Instant,
}

impl AppState {
    /// Wrap an engine
    #[must_use]
    pub fn new(engine: Arc<RelayEngine>) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }

    /// Metrics registry shared with the engine
    #[must_use]
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        self.engine.metrics()
    }
}
