//! Soft, in-memory channel exclusion.

use dashmap::DashMap;
use relay_core::ChannelId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Channels temporarily removed from rotation after a failure.
///
/// A cooldown never touches the persisted channel status; it expires on its own.
#[derive(Debug, Default)]
pub struct Cooldowns {
    until: DashMap<ChannelId, Instant>,
}

impl Cooldowns {
    /// Create an empty cooldown table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude `id` for `window`. A zero window is a no-op, and an existing
    /// longer cooldown is kept.
    pub fn cool_down(&self, id: ChannelId, window: Duration) {
        if window.is_zero() {
            return;
        }
        let until = Instant::now() + window;
        self.until
            .entry(id)
            .and_modify(|current| {
                if *current < until {
                    *current = until;
                }
            })
            .or_insert(until);
        debug!(channel_id = id, cooldown = ?window, "Channel cooling down");
    }

    /// Whether `id` is still cooling down; expired entries are dropped
    #[must_use]
    pub fn is_cooling_down(&self, id: ChannelId) -> bool {
        let now = Instant::now();
        match self.until.get(&id).map(|until| *until) {
            Some(until) if until > now => true,
            Some(_) => {
                self.until.remove_if(&id, |_, until| *until <= now);
                false
            }
            None => false,
        }
    }

    /// Lift a cooldown early
    pub fn clear(&self, id: ChannelId) {
        self.until.remove(&id);
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.until.retain(|_, until| *until > now);
    }

    /// Number of tracked entries, expired or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.until.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.until.is_empty()
    }
}
