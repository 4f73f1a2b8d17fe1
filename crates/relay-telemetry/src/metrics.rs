//! Prometheus metrics.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metrics error
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Registration failed
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Outcome of a single upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Upstream answered successfully
    Success,
    /// Failure that was retried on another channel
    Retried,
    /// Failure that ended the relay
    Failed,
}

impl AttemptOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retried => "retried",
            Self::Failed => "failed",
        }
    }
}

/// Relay metrics registered on a private registry
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
    attempts: IntCounterVec,
    retries: IntCounter,
    channel_disabled: IntCounter,
    cache_hits: IntCounter,
    quota_consumed: IntCounter,
}

impl RelayMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("relay".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Relayed requests by endpoint and status"),
            &["endpoint", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "End-to-end relay latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["endpoint"],
        )?;
        let attempts = IntCounterVec::new(
            Opts::new("upstream_attempts_total", "Upstream attempts by provider and outcome"),
            &["provider", "outcome"],
        )?;
        let retries = IntCounter::new("retries_total", "Failovers to another channel")?;
        let channel_disabled =
            IntCounter::new("channel_disabled_total", "Channels disabled by error classification")?;
        let cache_hits = IntCounter::new("cache_hits_total", "Responses replayed from cache")?;
        let quota_consumed = IntCounter::new("quota_consumed_total", "Quota settled")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(attempts.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(channel_disabled.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(quota_consumed.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            attempts,
            retries,
            channel_disabled,
            cache_hits,
            quota_consumed,
        })
    }

    /// Record a finished request
    pub fn record_request(&self, endpoint: &str, status: u16, elapsed: Duration) {
        self.requests
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
        self.duration
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    /// Record one upstream attempt
    pub fn record_attempt(&self, provider: &str, outcome: AttemptOutcome) {
        self.attempts
            .with_label_values(&[provider, outcome.as_str()])
            .inc();
        if outcome == AttemptOutcome::Retried {
            self.retries.inc();
        }
    }

    /// Record an automatic channel disable
    pub fn record_channel_disabled(&self) {
        self.channel_disabled.inc();
    }

    /// Record a cache replay
    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    /// Record settled quota
    pub fn record_quota(&self, quota: i64) {
        if let Ok(quota) = u64::try_from(quota) {
            self.quota_consumed.inc_by(quota);
        }
    }

    /// Render all metrics in the Prometheus text format
    #[must_use]
    pub fn gather(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_recorded_series() {
        let metrics = RelayMetrics::new().expect("metrics");
        metrics.record_request("chat_completions", 200, Duration::from_millis(120));
        metrics.record_attempt("openai", AttemptOutcome::Retried);
        metrics.record_attempt("openai", AttemptOutcome::Success);
        metrics.record_quota(25);
        metrics.record_quota(-3);

        let text = metrics.gather();
        assert!(text.contains("relay_requests_total{endpoint=\"chat_completions\",status=\"200\"} 1"));
        assert!(text.contains("relay_retries_total 1"));
        assert!(text.contains("relay_quota_consumed_total 25"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = RelayMetrics::new().expect("metrics");
        let b = RelayMetrics::new().expect("metrics");
        a.record_cache_hit();

        assert!(a.gather().contains("relay_cache_hits_total 1"));
        assert!(b.gather().contains("relay_cache_hits_total 0"));
    }
}
