//! Two-phase quota metering.
//!
//! A request first reserves its estimated cost against both the user ledger
//! and the token ledger. The reservation is then consumed by exactly one of
//! [`QuotaReservation::settle`] or [`QuotaReservation::refund`]; both take
//! `self`, and a reservation dropped without either is refunded in the
//! background.

use chrono::Utc;
use relay_core::{ApiToken, ChannelId, Datastore, RelayError, RelayResult, TokenId, Usage, UsageLog, UserId};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::pricing::PriceQuote;

/// Users holding more than this multiple of an estimate are not pre-charged
pub const TRUSTED_QUOTA_MULTIPLE: i64 = 100;

/// Reserves and settles quota against the datastore ledger
#[derive(Clone)]
pub struct QuotaMeter {
    store: Arc<dyn Datastore>,
    extra_reserve: i64,
}

impl QuotaMeter {
    /// Create a meter; `extra_reserve` is added to every token-priced reservation
    #[must_use]
    pub fn new(store: Arc<dyn Datastore>, extra_reserve: i64) -> Self {
        Self {
            store,
            extra_reserve,
        }
    }

    /// Reserve the estimated cost of a request.
    ///
    /// The user and, unless unlimited, the token must both cover the
    /// estimate. Users holding more than [`TRUSTED_QUOTA_MULTIPLE`] times the
    /// estimate are trusted and nothing is held; they pay the full cost at
    /// settlement. Every reservation goes through settlement, so usage is
    /// logged either way.
    pub async fn reserve(
        &self,
        token: &ApiToken,
        quote: PriceQuote,
        prompt_tokens: u32,
    ) -> RelayResult<QuotaReservation> {
        let estimate = quote.pre_consumed(prompt_tokens, self.extra_reserve);
        let mut trusted = false;

        if estimate > 0 {
            let user_quota = self.store.get_user_quota(token.user_id).await?;
            if user_quota < estimate {
                return Err(RelayError::quota_exceeded(format!(
                    "user quota is not enough: remaining {user_quota}, required {estimate}"
                )));
            }
            if !token.unlimited_quota && token.remain_quota < estimate {
                return Err(RelayError::quota_exceeded(format!(
                    "token quota is not enough: remaining {}, required {estimate}",
                    token.remain_quota
                )));
            }
            trusted = user_quota > estimate.saturating_mul(TRUSTED_QUOTA_MULTIPLE);
        }

        let must_debit = estimate > 0 && !trusted;
        if must_debit {
            self.store.debit_user_quota(token.user_id, estimate).await?;
            if !token.unlimited_quota {
                if let Err(e) = self.store.debit_token_quota(token.id, estimate).await {
                    if let Err(undo) = self.store.credit_user_quota(token.user_id, estimate).await {
                        error!(user_id = token.user_id, amount = estimate, error = %undo, "Failed to return user quota");
                    }
                    return Err(e);
                }
            }
        }
        let pre_consumed = if must_debit { estimate } else { 0 };

        debug!(
            token_id = token.id,
            user_id = token.user_id,
            model = %quote.model,
            prompt_tokens,
            estimate,
            pre_consumed,
            trusted,
            "Quota reserved"
        );

        Ok(QuotaReservation {
            store: Arc::clone(&self.store),
            quote,
            user_id: token.user_id,
            token_id: token.id,
            token_name: token.name.clone(),
            unlimited: token.unlimited_quota,
            prompt_tokens,
            pre_consumed,
            debited: must_debit,
            resolved: false,
            started: Instant::now(),
        })
    }
}

impl std::fmt::Debug for QuotaMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaMeter")
            .field("extra_reserve", &self.extra_reserve)
            .finish_non_exhaustive()
    }
}

/// Outcome of a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// True cost charged
    pub quota: i64,
    /// Ledger adjustment applied on top of the reservation
    pub delta: i64,
}

/// Quota held for one in-flight request
pub struct QuotaReservation {
    store: Arc<dyn Datastore>,
    quote: PriceQuote,
    user_id: UserId,
    token_id: TokenId,
    token_name: String,
    unlimited: bool,
    prompt_tokens: u32,
    pre_consumed: i64,
    debited: bool,
    resolved: bool,
    started: Instant,
}

impl QuotaReservation {
    /// Amount held; zero for trusted users and free requests
    #[must_use]
    pub fn pre_consumed(&self) -> i64 {
        self.pre_consumed
    }

    /// Whether the reservation actually debited the ledgers
    #[must_use]
    pub fn is_debited(&self) -> bool {
        self.debited
    }

    /// Estimated prompt tokens the reservation was sized for
    #[must_use]
    pub fn prompt_tokens(&self) -> u32 {
        self.prompt_tokens
    }

    /// Price used for this request
    #[must_use]
    pub fn quote(&self) -> &PriceQuote {
        &self.quote
    }

    /// Charge the true cost of `usage` served by `channel_id`.
    ///
    /// The ledger adjustments must succeed. The usage log and aggregate
    /// counters are written afterwards; their failures are logged and ignored.
    pub async fn settle(mut self, channel_id: ChannelId, usage: Usage, is_stream: bool) -> RelayResult<Settlement> {
        self.resolved = true;
        let quota = self.quote.charge(&usage);
        let held = if self.debited { self.pre_consumed } else { 0 };
        let delta = quota - held;

        if delta != 0 {
            self.store.adjust_user_quota(self.user_id, delta).await?;
            if !self.unlimited {
                self.store.adjust_token_quota(self.token_id, delta).await?;
            }
        }

        let log = UsageLog {
            user_id: self.user_id,
            token_id: self.token_id,
            token_name: std::mem::take(&mut self.token_name),
            channel_id,
            model: self.quote.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota,
            request_time_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            is_stream,
            content: self.quote.describe(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_usage_log(log).await {
            warn!(token_id = self.token_id, error = %e, "Failed to record usage log");
        }
        if quota > 0 {
            if let Err(e) = self
                .store
                .update_usage_aggregates(self.user_id, channel_id, quota)
                .await
            {
                warn!(user_id = self.user_id, channel_id, error = %e, "Failed to update usage aggregates");
            }
        }

        debug!(
            token_id = self.token_id,
            channel_id,
            model = %self.quote.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            quota,
            delta,
            "Quota settled"
        );
        Ok(Settlement { quota, delta })
    }

    /// Return the reserved amount, if one was debited
    pub async fn refund(mut self) -> RelayResult<()> {
        self.resolved = true;
        if !self.debited {
            return Ok(());
        }
        release(
            self.store.as_ref(),
            self.user_id,
            (!self.unlimited).then_some(self.token_id),
            self.pre_consumed,
        )
        .await?;
        debug!(token_id = self.token_id, amount = self.pre_consumed, "Reserved quota refunded");
        Ok(())
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.resolved || !self.debited {
            return;
        }
        let store = Arc::clone(&self.store);
        let user_id = self.user_id;
        let token_id = self.token_id;
        let token = (!self.unlimited).then_some(token_id);
        let amount = self.pre_consumed;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release(store.as_ref(), user_id, token, amount).await {
                        error!(token_id, amount, error = %e, "Failed to refund abandoned reservation");
                    }
                });
            }
            Err(_) => error!(token_id, amount, "Reservation dropped outside a runtime, quota not refunded"),
        }
    }
}

/// Credit a held amount back to the user and, when metered, the token
async fn release(
    store: &dyn Datastore,
    user_id: UserId,
    token_id: Option<TokenId>,
    amount: i64,
) -> RelayResult<()> {
    store.credit_user_quota(user_id, amount).await?;
    if let Some(token_id) = token_id {
        store.credit_token_quota(token_id, amount).await?;
    }
    Ok(())
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("token_id", &self.token_id)
            .field("model", &self.quote.model)
            .field("pre_consumed", &self.pre_consumed)
            .field("debited", &self.debited)
            .finish_non_exhaustive()
    }
}
