//! Failover policy.
//!
//! Decides whether a failed attempt moves the request to another channel and
//! how long to wait before doing so.

use rand::Rng;
use relay_core::RelayError;
use std::time::Duration;

/// Failover configuration
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Additional attempts after the first one
    pub retry_times: u32,
    /// How long a failed channel stays out of rotation
    pub cooldown: Duration,
    /// Pause before each retry
    pub delay: Duration,
    /// Jitter factor applied to `delay` (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry_times: 0,
            cooldown: Duration::from_secs(5),
            delay: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

/// Failover policy implementation
#[derive(Debug, Clone, Default)]
pub struct FailoverPolicy {
    config: FailoverConfig,
}

impl FailoverPolicy {
    /// Create a policy with the given configuration
    #[must_use]
    pub fn new(config: FailoverConfig) -> Self {
        Self { config }
    }

    /// Create a policy with a custom retry budget
    #[must_use]
    pub fn with_retry_times(retry_times: u32) -> Self {
        Self::new(FailoverConfig {
            retry_times,
            ..Default::default()
        })
    }

    /// Retries allowed after the first attempt
    #[must_use]
    pub fn retry_times(&self) -> u32 {
        self.config.retry_times
    }

    /// Cooldown applied to a channel after a retryable failure
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }

    /// Whether an upstream status should move the request to another channel.
    ///
    /// 429 and 5xx retry; 400 and 2xx never do; any other status retries
    /// unless the caller pinned the channel.
    #[must_use]
    pub fn should_retry(&self, status: u16, pinned: bool) -> bool {
        if pinned {
            return false;
        }
        match status {
            429 | 500..=599 => true,
            400 | 200..=299 => false,
            _ => true,
        }
    }

    /// Whether `error` from an attempt is eligible for failover
    #[must_use]
    pub fn is_retryable(&self, error: &RelayError, pinned: bool) -> bool {
        !error.is_local() && self.should_retry(error.status_code(), pinned)
    }

    /// Pause before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.config.delay.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.config.delay.as_secs_f64();
        let jitter_range = base * self.config.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}
