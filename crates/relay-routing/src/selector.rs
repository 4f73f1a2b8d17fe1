//! Channel selection.
//!
//! Selection walks the priority tiers of a (group, model) in order and picks
//! from the first tier that still has a selectable channel, weighted by the
//! channel weight. A channel is selectable when it is enabled, not excluded by
//! the caller's filter and not cooling down.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_core::{
    Channel, ChannelId, ChannelStatus, Datastore, RelayError, RelayResult, RoutingFailure,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cooldown::Cooldowns;
use crate::index::ChannelIndex;

/// Per-call selection filters
#[derive(Debug, Clone, Default)]
pub struct SelectFilter {
    /// Channels already tried by this request
    pub exclude: Vec<ChannelId>,
    /// Skip channels flagged `only_chat`
    pub skip_only_chat: bool,
}

impl SelectFilter {
    /// Filter with nothing excluded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude a channel
    #[must_use]
    pub fn excluding(mut self, id: ChannelId) -> Self {
        if !self.exclude.contains(&id) {
            self.exclude.push(id);
        }
        self
    }

    /// Skip only-chat channels
    #[must_use]
    pub fn skip_only_chat(mut self, skip: bool) -> Self {
        self.skip_only_chat = skip;
        self
    }

    fn admits(&self, channel: &Channel) -> bool {
        !self.exclude.contains(&channel.id) && !(self.skip_only_chat && channel.only_chat)
    }
}

/// Picks a channel for (group, model)
pub struct ChannelSelector {
    index: ArcSwap<ChannelIndex>,
    cooldowns: Cooldowns,
    rng: Mutex<StdRng>,
}

impl ChannelSelector {
    /// Create an empty selector seeded from the OS
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create an empty selector with a fixed seed, for reproducible picks
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            index: ArcSwap::from_pointee(ChannelIndex::default()),
            cooldowns: Cooldowns::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Replace the index with one built from `channels`
    pub fn rebuild(&self, channels: Vec<Channel>) {
        let index = ChannelIndex::build(channels);
        debug!(channels = index.len(), "Channel index rebuilt");
        self.index.store(Arc::new(index));
    }

    /// Reload every channel from the datastore and swap the index
    pub async fn refresh(&self, store: &dyn Datastore) -> RelayResult<usize> {
        let channels = store.list_channels().await?;
        let count = channels.len();
        self.rebuild(channels);
        Ok(count)
    }

    /// Refresh the index every `every` until the task is aborted
    pub fn spawn_refresh(
        self: &Arc<Self>,
        store: Arc<dyn Datastore>,
        every: Duration,
    ) -> JoinHandle<()> {
        let selector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match selector.refresh(store.as_ref()).await {
                    Ok(count) => debug!(channels = count, "Periodic channel refresh"),
                    Err(e) => warn!(error = %e, "Channel refresh failed"),
                }
                selector.cooldowns.purge_expired();
            }
        })
    }

    /// Current index snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<ChannelIndex> {
        self.index.load_full()
    }

    /// Channel by ID from the current snapshot
    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.index.load().get(id)
    }

    /// Reflect a persisted status change without a full refresh
    pub fn set_status(&self, id: ChannelId, status: ChannelStatus) {
        self.index.rcu(|index| index.with_status(id, status));
        if status.is_enabled() {
            self.cooldowns.clear(id);
        }
    }

    /// Remove a channel from rotation for `window`
    pub fn cool_down(&self, id: ChannelId, window: Duration) {
        self.cooldowns.cool_down(id, window);
    }

    /// Whether a channel is currently cooling down
    #[must_use]
    pub fn is_cooling_down(&self, id: ChannelId) -> bool {
        self.cooldowns.is_cooling_down(id)
    }

    /// Models `group` can currently reach
    #[must_use]
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        self.index.load().models_for_group(group)
    }

    /// Pick a channel for `model` in `group`.
    ///
    /// Fails with `NoneConfigured` when no channel lists the model for the
    /// group, and with `Unavailable` when every configured channel is
    /// disabled, excluded or cooling down.
    pub fn next(&self, group: &str, model: &str, filter: &SelectFilter) -> RelayResult<Arc<Channel>> {
        let index = self.index.load();
        let candidates = index.candidates(group, model);
        if candidates.is_empty() {
            return Err(RelayError::routing(
                RoutingFailure::NoneConfigured,
                format!("no channel is configured for model {model} under group {group}"),
            ));
        }

        let selectable: Vec<&Arc<Channel>> = candidates
            .iter()
            .filter(|c| c.is_enabled() && filter.admits(c) && !self.cooldowns.is_cooling_down(c.id))
            .collect();

        let Some(top) = selectable.first().map(|c| c.priority) else {
            return Err(RelayError::routing(
                RoutingFailure::Unavailable,
                format!(
                    "no available channel for model {model} under group {group}: all are disabled or cooling down"
                ),
            ));
        };

        let tier: Vec<&Arc<Channel>> = selectable.into_iter().take_while(|c| c.priority == top).collect();
        let picked = self.weighted_pick(&tier);
        debug!(
            channel_id = picked.id,
            group = %group,
            model = %model,
            priority = top,
            tier_size = tier.len(),
            "Channel selected"
        );
        Ok(Arc::clone(picked))
    }

    /// Like [`next`](Self::next), but reads through to the datastore when
    /// the snapshot has no channel for `model`.
    ///
    /// A channel added since the last refresh is served right away: if the
    /// datastore has an eligible channel the index is reloaded and selection
    /// runs once more.
    pub async fn next_or_reload(
        &self,
        store: &dyn Datastore,
        group: &str,
        model: &str,
        filter: &SelectFilter,
    ) -> RelayResult<Arc<Channel>> {
        let missing = match self.next(group, model, filter) {
            Err(e @ RelayError::Routing { kind: RoutingFailure::NoneConfigured, .. }) => e,
            other => return other,
        };
        if store.get_eligible_channels(group, model).await?.is_empty() {
            return Err(missing);
        }
        let count = self.refresh(store).await?;
        info!(group = %group, model = %model, channels = count, "Channel index reloaded on miss");
        self.next(group, model, filter)
    }

    fn weighted_pick<'a>(&self, tier: &[&'a Arc<Channel>]) -> &'a Arc<Channel> {
        let total: u64 = tier.iter().map(|c| weight(c)).sum();
        let mut roll = self.rng.lock().gen_range(0..total);
        for &channel in tier {
            let w = weight(channel);
            if roll < w {
                return channel;
            }
            roll -= w;
        }
        tier[tier.len() - 1]
    }
}

fn weight(channel: &Channel) -> u64 {
    u64::from(channel.weight.max(1))
}

impl Default for ChannelSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSelector")
            .field("channels", &self.index.load().len())
            .field("cooldowns", &self.cooldowns.len())
            .finish_non_exhaustive()
    }
}

/// Load the initial index, logging how many channels were found
pub async fn bootstrap(selector: &ChannelSelector, store: &dyn Datastore) -> RelayResult<()> {
    let count = selector.refresh(store).await?;
    info!(channels = count, "Channel index loaded");
    Ok(())
}
