//! Immutable channel index snapshot.

use relay_core::types::model_matches;
use relay_core::{Channel, ChannelId, ChannelStatus};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Channels of one (group, model pattern), best priority first
type Candidates = Vec<ChannelId>;

/// group → model pattern → channels.
///
/// The index holds channels in every status so the selector can tell "nothing
/// configured" apart from "configured but unavailable". Snapshots are never
/// mutated in place; status changes produce a new snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    channels: HashMap<ChannelId, Arc<Channel>>,
    groups: HashMap<String, HashMap<String, Candidates>>,
}

impl ChannelIndex {
    /// Build an index from the full channel set
    #[must_use]
    pub fn build(channels: Vec<Channel>) -> Self {
        let channels: HashMap<ChannelId, Arc<Channel>> = channels
            .into_iter()
            .map(|channel| (channel.id, Arc::new(channel)))
            .collect();

        let mut groups: HashMap<String, HashMap<String, Candidates>> = HashMap::new();
        for channel in channels.values() {
            for group in &channel.groups {
                let models = groups.entry(group.clone()).or_default();
                for model in &channel.models {
                    models.entry(model.clone()).or_default().push(channel.id);
                }
            }
        }

        for models in groups.values_mut() {
            for ids in models.values_mut() {
                ids.sort_by_key(|id| {
                    let priority = channels.get(id).map_or(0, |c| c.priority);
                    (std::cmp::Reverse(priority), *id)
                });
                ids.dedup();
            }
        }

        Self { channels, groups }
    }

    /// Look up a channel by ID
    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    /// Number of indexed channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channels configured for `model` in `group`, highest priority first.
    ///
    /// Exact model entries win; wildcard patterns are consulted only when no
    /// channel lists the model by name.
    #[must_use]
    pub fn candidates(&self, group: &str, model: &str) -> Vec<Arc<Channel>> {
        let Some(models) = self.groups.get(group) else {
            return Vec::new();
        };

        let ids: Vec<ChannelId> = match models.get(model) {
            Some(ids) if !ids.is_empty() => ids.clone(),
            _ => {
                let mut ids: Vec<ChannelId> = models
                    .iter()
                    .filter(|(pattern, _)| pattern.ends_with('*') && model_matches(pattern, model))
                    .flat_map(|(_, ids)| ids.iter().copied())
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        };

        let mut candidates: Vec<Arc<Channel>> =
            ids.iter().filter_map(|id| self.channels.get(id).cloned()).collect();
        candidates.sort_by_key(|c| (std::cmp::Reverse(c.priority), c.id));
        candidates
    }

    /// Concrete model names offered to `group` by enabled channels, sorted
    #[must_use]
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let Some(models) = self.groups.get(group) else {
            return Vec::new();
        };
        models
            .iter()
            .filter(|(pattern, _)| !pattern.ends_with('*'))
            .filter(|(_, ids)| {
                ids.iter()
                    .any(|id| self.channels.get(id).is_some_and(|c| c.is_enabled()))
            })
            .map(|(model, _)| model.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Copy of this snapshot with one channel's status replaced
    #[must_use]
    pub fn with_status(&self, id: ChannelId, status: ChannelStatus) -> Self {
        let mut next = self.clone();
        if let Some(channel) = next.channels.get_mut(&id) {
            if channel.status != status {
                let mut updated = Channel::clone(channel);
                updated.status = status;
                *channel = Arc::new(updated);
            }
        }
        next
    }
}
