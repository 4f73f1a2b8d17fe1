//! Collaborator contracts and the in-memory datastore.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::error::{RelayError, RelayResult};
use crate::request::ChatMessage;
use crate::types::{ApiToken, Channel, ChannelId, ChannelStatus, Price, TokenId, UsageLog, User, UserId};

/// Persistence used by the relay
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Look up a channel
    async fn get_channel_by_id(&self, id: ChannelId) -> RelayResult<Option<Channel>>;

    /// All channels, in any status
    async fn list_channels(&self) -> RelayResult<Vec<Channel>>;

    /// Enabled channels serving `model` for `group`
    async fn get_eligible_channels(&self, group: &str, model: &str) -> RelayResult<Vec<Channel>>;

    /// Set a channel status; returns whether the status changed
    async fn update_channel_status(&self, id: ChannelId, status: ChannelStatus) -> RelayResult<bool>;

    /// Store the latest upstream balance
    async fn update_channel_balance(&self, id: ChannelId, balance: f64) -> RelayResult<()>;

    /// Store the latest measured response time
    async fn update_channel_response_time(&self, id: ChannelId, millis: u64) -> RelayResult<()>;

    /// Look up a token by ID
    async fn get_token_by_id(&self, id: TokenId) -> RelayResult<Option<ApiToken>>;

    /// Look up a token by its bearer key
    async fn get_token_by_key(&self, key: &str) -> RelayResult<Option<ApiToken>>;

    /// Atomically subtract `amount`; fails with `QuotaExceeded` when short
    async fn debit_token_quota(&self, id: TokenId, amount: i64) -> RelayResult<()>;

    /// Atomically add `amount`
    async fn credit_token_quota(&self, id: TokenId, amount: i64) -> RelayResult<()>;

    /// Apply a settlement delta (positive charges, negative refunds) without
    /// a balance check; delivered work is charged even past zero
    async fn adjust_token_quota(&self, id: TokenId, delta: i64) -> RelayResult<()>;

    /// Remaining quota of a user
    async fn get_user_quota(&self, id: UserId) -> RelayResult<i64>;

    /// Atomically subtract `amount`; fails with `QuotaExceeded` when short
    async fn debit_user_quota(&self, id: UserId, amount: i64) -> RelayResult<()>;

    /// Atomically add `amount`
    async fn credit_user_quota(&self, id: UserId, amount: i64) -> RelayResult<()>;

    /// Apply a settlement delta to a user, without a balance check
    async fn adjust_user_quota(&self, id: UserId, delta: i64) -> RelayResult<()>;

    /// Append a usage log
    async fn record_usage_log(&self, log: UsageLog) -> RelayResult<()>;

    /// Bump user and channel used-quota aggregates
    async fn update_usage_aggregates(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        quota: i64,
    ) -> RelayResult<()>;
}

/// Model pricing lookup
pub trait PricingTable: Send + Sync {
    /// Price for `model`, if known
    fn get_price(&self, model: &str) -> Option<Price>;

    /// Multiplier applied to a token group
    fn group_ratio(&self, group: &str) -> f64 {
        let _ = group;
        1.0
    }

    /// Every priced model name
    fn models(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Operator notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a notification
    async fn notify(&self, subject: &str, body: &str) -> RelayResult<()>;
}

/// Hosted storage for generated media
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload bytes and return a public URL
    async fn upload(&self, data: Bytes, filename: &str) -> RelayResult<String>;
}

/// Prompt and completion token counting
pub trait TokenCounter: Send + Sync {
    /// Tokens in a chat prompt
    fn count_messages(&self, messages: &[ChatMessage], model: &str) -> u32;

    /// Tokens in free text
    fn count_text(&self, text: &str, model: &str) -> u32;
}

/// Notifier that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> RelayResult<()> {
        warn!(subject = %subject, body = %body, "Operator notification");
        Ok(())
    }
}

/// In-memory datastore.
///
/// Quota debits run under the entry's shard write lock, so concurrent debits
/// against one token or user never overdraw it.
#[derive(Default)]
pub struct MemoryDatastore {
    channels: DashMap<ChannelId, Channel>,
    tokens: DashMap<TokenId, ApiToken>,
    token_keys: DashMap<String, TokenId>,
    users: DashMap<UserId, User>,
    logs: Mutex<Vec<UsageLog>>,
    user_used: DashMap<UserId, i64>,
    channel_used: DashMap<ChannelId, i64>,
}

impl MemoryDatastore {
    /// Create an empty datastore
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared empty datastore
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a channel
    pub fn upsert_channel(&self, channel: Channel) {
        self.channels.insert(channel.id, channel);
    }

    /// Insert or replace a token
    pub fn upsert_token(&self, token: ApiToken) {
        self.token_keys.insert(token.key.clone(), token.id);
        self.tokens.insert(token.id, token);
    }

    /// Insert or replace a user
    pub fn upsert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Current remaining quota of a user
    #[must_use]
    pub fn user_quota(&self, id: UserId) -> Option<i64> {
        self.users.get(&id).map(|u| u.quota)
    }

    /// Current remaining quota of a token
    #[must_use]
    pub fn token_quota(&self, id: TokenId) -> Option<i64> {
        self.tokens.get(&id).map(|t| t.remain_quota)
    }

    /// Current status of a channel
    #[must_use]
    pub fn channel_status(&self, id: ChannelId) -> Option<ChannelStatus> {
        self.channels.get(&id).map(|c| c.status)
    }

    /// Snapshot of the usage logs
    #[must_use]
    pub fn usage_logs(&self) -> Vec<UsageLog> {
        self.logs.lock().clone()
    }

    /// Used quota aggregated for a user
    #[must_use]
    pub fn user_used_quota(&self, id: UserId) -> i64 {
        self.user_used.get(&id).map_or(0, |v| *v)
    }

    /// Used quota aggregated for a channel
    #[must_use]
    pub fn channel_used_quota(&self, id: ChannelId) -> i64 {
        self.channel_used.get(&id).map_or(0, |v| *v)
    }

    fn user_mut(&self, id: UserId) -> RelayResult<dashmap::mapref::one::RefMut<'_, UserId, User>> {
        self.users
            .get_mut(&id)
            .ok_or_else(|| RelayError::datastore(format!("user {id} not found")))
    }

    fn with_channel<F>(&self, id: ChannelId, f: F) -> RelayResult<()>
    where
        F: FnOnce(&mut Channel),
    {
        let mut channel = self
            .channels
            .get_mut(&id)
            .ok_or_else(|| RelayError::datastore(format!("channel {id} not found")))?;
        f(&mut channel);
        Ok(())
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_channel_by_id(&self, id: ChannelId) -> RelayResult<Option<Channel>> {
        Ok(self.channels.get(&id).map(|c| c.clone()))
    }

    async fn list_channels(&self) -> RelayResult<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.channels.iter().map(|c| c.clone()).collect();
        channels.sort_by_key(|c| c.id);
        Ok(channels)
    }

    async fn get_eligible_channels(&self, group: &str, model: &str) -> RelayResult<Vec<Channel>> {
        let mut channels: Vec<Channel> = self
            .channels
            .iter()
            .filter(|c| c.is_enabled() && c.serves(group, model))
            .map(|c| c.clone())
            .collect();
        channels.sort_by_key(|c| c.id);
        Ok(channels)
    }

    async fn update_channel_status(&self, id: ChannelId, status: ChannelStatus) -> RelayResult<bool> {
        let mut changed = false;
        self.with_channel(id, |channel| {
            changed = channel.status != status;
            channel.status = status;
        })?;
        Ok(changed)
    }

    async fn update_channel_balance(&self, id: ChannelId, balance: f64) -> RelayResult<()> {
        self.with_channel(id, |channel| channel.balance = balance)
    }

    async fn update_channel_response_time(&self, id: ChannelId, millis: u64) -> RelayResult<()> {
        self.with_channel(id, |channel| channel.response_time_ms = millis)
    }

    async fn get_token_by_id(&self, id: TokenId) -> RelayResult<Option<ApiToken>> {
        Ok(self.tokens.get(&id).map(|t| t.clone()))
    }

    async fn get_token_by_key(&self, key: &str) -> RelayResult<Option<ApiToken>> {
        let Some(id) = self.token_keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.tokens.get(&id).map(|t| t.clone()))
    }

    async fn debit_token_quota(&self, id: TokenId, amount: i64) -> RelayResult<()> {
        let mut token = self
            .tokens
            .get_mut(&id)
            .ok_or_else(|| RelayError::datastore(format!("token {id} not found")))?;
        if token.remain_quota < amount {
            return Err(RelayError::quota_exceeded(format!(
                "token quota is not enough: remaining {}, required {amount}",
                token.remain_quota
            )));
        }
        token.remain_quota -= amount;
        Ok(())
    }

    async fn credit_token_quota(&self, id: TokenId, amount: i64) -> RelayResult<()> {
        let mut token = self
            .tokens
            .get_mut(&id)
            .ok_or_else(|| RelayError::datastore(format!("token {id} not found")))?;
        token.remain_quota += amount;
        Ok(())
    }

    async fn adjust_token_quota(&self, id: TokenId, delta: i64) -> RelayResult<()> {
        let mut token = self
            .tokens
            .get_mut(&id)
            .ok_or_else(|| RelayError::datastore(format!("token {id} not found")))?;
        token.remain_quota -= delta;
        Ok(())
    }

    async fn get_user_quota(&self, id: UserId) -> RelayResult<i64> {
        self.users
            .get(&id)
            .map(|u| u.quota)
            .ok_or_else(|| RelayError::datastore(format!("user {id} not found")))
    }

    async fn debit_user_quota(&self, id: UserId, amount: i64) -> RelayResult<()> {
        let mut user = self.user_mut(id)?;
        if user.quota < amount {
            return Err(RelayError::quota_exceeded(format!(
                "user quota is not enough: remaining {}, required {amount}",
                user.quota
            )));
        }
        user.quota -= amount;
        Ok(())
    }

    async fn credit_user_quota(&self, id: UserId, amount: i64) -> RelayResult<()> {
        self.user_mut(id)?.quota += amount;
        Ok(())
    }

    async fn adjust_user_quota(&self, id: UserId, delta: i64) -> RelayResult<()> {
        self.user_mut(id)?.quota -= delta;
        Ok(())
    }

    async fn record_usage_log(&self, log: UsageLog) -> RelayResult<()> {
        self.logs.lock().push(log);
        Ok(())
    }

    async fn update_usage_aggregates(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        quota: i64,
    ) -> RelayResult<()> {
        *self.user_used.entry(user_id).or_insert(0) += quota;
        *self.channel_used.entry(channel_id).or_insert(0) += quota;
        Ok(())
    }
}
