//! The relay engine.
//!
//! Every endpoint family runs the same pipeline: price the caller-facing
//! model, reserve quota, then try channels until one answers or the failover
//! policy gives up. Successful attempts settle the reservation from the
//! reported usage; terminal failures refund it.

use relay_billing::{EstimatingTokenCounter, ModelPricingTable, QuotaMeter, QuotaReservation};
use relay_core::{
    Adaptor, Channel, ChannelStatus, Datastore, LogNotifier, ModelList, ModelObject, Notifier,
    ObjectStorage, OpenAIError, RelayError, RelayResult, RoutingFailure, TokenCounter, Usage,
};
use relay_providers::AdaptorFactory;
use relay_resilience::{ChannelHealth, FailoverConfig, FailoverPolicy, HealthConfig, ResponseCache};
use relay_routing::{ChannelSelector, SelectFilter};
use relay_telemetry::{AttemptOutcome, RelayMetrics};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::context::{RelayContext, RelayKind};

/// Message returned when the last attempt was still rate limited
pub const SATURATED_MESSAGE: &str =
    "The upstream load for the current group is saturated, please try again later";

/// Owner shown for models without a configured label
const DEFAULT_OWNER: &str = "relay";

/// Where and how one relay is routed
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub kind: RelayKind,
    /// Caller-facing model
    pub model: String,
    pub skip_only_chat: bool,
}

impl Route {
    pub fn new(kind: RelayKind, model: &str) -> Self {
        Self {
            kind,
            model: model.to_string(),
            skip_only_chat: kind != RelayKind::Chat,
        }
    }

    /// Chat requests carrying tools cannot go to only-chat channels either
    pub fn with_tools(mut self, has_tools: bool) -> Self {
        self.skip_only_chat |= has_tools;
        self
    }
}

/// Result of a successful attempt
pub(crate) struct Attempted<T> {
    pub value: T,
    pub channel: Arc<Channel>,
}

/// Relay orchestrator shared by all request handlers
pub struct RelayEngine {
    pub(crate) store: Arc<dyn Datastore>,
    pub(crate) selector: Arc<ChannelSelector>,
    pub(crate) factory: Arc<dyn AdaptorFactory>,
    pub(crate) pricing: Arc<ModelPricingTable>,
    pub(crate) meter: QuotaMeter,
    pub(crate) counter: Arc<dyn TokenCounter>,
    pub(crate) policy: FailoverPolicy,
    pub(crate) health: ChannelHealth,
    pub(crate) cache: ResponseCache,
    pub(crate) storage: Option<Arc<dyn ObjectStorage>>,
    pub(crate) metrics: Arc<RelayMetrics>,
}

impl RelayEngine {
    /// Start building an engine
    #[must_use]
    pub fn builder() -> RelayEngineBuilder {
        RelayEngineBuilder::default()
    }

    /// Backing datastore
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    /// Channel selector
    #[must_use]
    pub fn selector(&self) -> &Arc<ChannelSelector> {
        &self.selector
    }

    /// Pricing table
    #[must_use]
    pub fn pricing(&self) -> &Arc<ModelPricingTable> {
        &self.pricing
    }

    /// Metrics registry
    #[must_use]
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Models routable for `group`, sorted by owner then id
    #[must_use]
    pub fn models(&self, group: &str) -> ModelList {
        let mut data: Vec<ModelObject> = self
            .selector
            .models_for_group(group)
            .into_iter()
            .map(|id| {
                let owner = self
                    .pricing
                    .owned_by(&id)
                    .unwrap_or_else(|| DEFAULT_OWNER.to_string());
                ModelObject::new(id, owner)
            })
            .collect();
        data.sort_by(|a, b| a.owned_by.cmp(&b.owned_by).then_with(|| a.id.cmp(&b.id)));
        ModelList::new(data)
    }

    /// A single model routable for `group`
    pub fn model(&self, group: &str, id: &str) -> RelayResult<ModelObject> {
        self.models(group)
            .data
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| {
                RelayError::not_found(format!("The model '{id}' does not exist"), "model_not_found")
            })
    }

    /// Price the caller-facing model and reserve quota for it
    pub(crate) async fn reserve(
        &self,
        ctx: &RelayContext,
        model: &str,
        prompt_tokens: u32,
    ) -> RelayResult<QuotaReservation> {
        let quote = self.pricing.quote(model, ctx.group())?;
        self.meter.reserve(&ctx.token, quote, prompt_tokens).await
    }

    /// Settle a delivered buffered response.
    ///
    /// The caller already has a response; a failed ledger write is logged
    /// rather than turned into an error.
    pub(crate) async fn settle(
        &self,
        ctx: &RelayContext,
        reservation: QuotaReservation,
        channel_id: i64,
        usage: Usage,
    ) {
        match reservation.settle(channel_id, usage, false).await {
            Ok(settlement) => {
                self.metrics.record_quota(settlement.quota);
                debug!(request_id = %ctx.request_id, quota = settlement.quota, "Request settled");
            }
            Err(e) => {
                error!(request_id = %ctx.request_id, channel_id, error = %e, "Quota settlement failed");
            }
        }
    }

    /// Return a reservation after a terminal failure
    pub(crate) async fn refund(&self, ctx: &RelayContext, reservation: QuotaReservation) {
        if let Err(e) = reservation.refund().await {
            error!(request_id = %ctx.request_id, error = %e, "Quota refund failed");
        }
    }

    /// Reserve, dispatch, then settle or refund.
    ///
    /// `usage_of` may rewrite the response (e.g. to fill in reconciled usage)
    /// before the usage it returns is charged.
    pub(crate) async fn relay_buffered<T, F, Fut>(
        &self,
        ctx: &RelayContext,
        route: &Route,
        prompt_tokens: u32,
        invoke: F,
        usage_of: impl FnOnce(&mut T) -> Usage,
    ) -> RelayResult<Attempted<T>>
    where
        F: Fn(Arc<dyn Adaptor>, String) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let reservation = self.reserve(ctx, &route.model, prompt_tokens).await?;
        match self.dispatch(ctx, route, invoke).await {
            Ok(mut attempted) => {
                let usage = usage_of(&mut attempted.value);
                self.settle(ctx, reservation, attempted.channel.id, usage).await;
                Ok(attempted)
            }
            Err(e) => {
                self.refund(ctx, reservation).await;
                Err(e)
            }
        }
    }

    /// Try channels until one succeeds or the failover policy stops.
    ///
    /// `invoke` receives the adaptor and the upstream model name. Each retry
    /// excludes every channel already tried by this request; when no channel
    /// is left the last upstream error is returned.
    pub(crate) async fn dispatch<T, F, Fut>(
        &self,
        ctx: &RelayContext,
        route: &Route,
        invoke: F,
    ) -> RelayResult<Attempted<T>>
    where
        F: Fn(Arc<dyn Adaptor>, String) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let mut filter = SelectFilter::new().skip_only_chat(route.skip_only_chat);
        let mut last_error: Option<RelayError> = None;
        let mut attempt: u32 = 0;

        loop {
            let channel = match self.resolve(ctx, route, &filter).await {
                Ok(channel) => channel,
                Err(e) => return Err(last_error.map_or(e, |last| self.finalize(ctx, last))),
            };
            filter = filter.excluding(channel.id);
            let provider = channel.provider.as_str();

            debug!(
                request_id = %ctx.request_id,
                kind = route.kind.as_str(),
                channel_id = channel.id,
                model = %route.model,
                attempt,
                "Dispatching to channel"
            );

            let started = Instant::now();
            let result = match self.factory.create(&channel) {
                Ok(adaptor) => match adaptor.model_mapping(&route.model) {
                    Ok(upstream_model) => invoke(adaptor, upstream_model).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(value) => {
                    self.metrics.record_attempt(provider, AttemptOutcome::Success);
                    self.record_response_time(&channel, started.elapsed()).await;
                    return Ok(Attempted { value, channel });
                }
                Err(error) => error,
            };

            self.handle_failure(ctx, &channel, &error).await;

            let retry = attempt < self.policy.retry_times()
                && self.policy.is_retryable(&error, ctx.is_pinned());
            warn!(
                request_id = %ctx.request_id,
                channel_id = channel.id,
                model = %route.model,
                attempt,
                status = error.status_code(),
                retry,
                error = %error,
                "Upstream attempt failed"
            );
            if !retry {
                self.metrics.record_attempt(provider, AttemptOutcome::Failed);
                return Err(self.finalize(ctx, error));
            }

            self.metrics.record_attempt(provider, AttemptOutcome::Retried);
            attempt += 1;
            let delay = self.policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            last_error = Some(error);
        }
    }

    async fn resolve(&self, ctx: &RelayContext, route: &Route, filter: &SelectFilter) -> RelayResult<Arc<Channel>> {
        let Some(id) = ctx.pinned_channel else {
            return self
                .selector
                .next_or_reload(self.store.as_ref(), ctx.group(), &route.model, filter)
                .await;
        };
        let channel = self.selector.channel(id).ok_or_else(|| {
            RelayError::not_found(format!("channel #{id} does not exist"), "channel_not_found")
        })?;
        if !channel.is_enabled() {
            return Err(RelayError::routing(
                RoutingFailure::Unavailable,
                format!("channel #{id} is disabled"),
            ));
        }
        Ok(channel)
    }

    /// Cool down or disable the channel an error is attributed to
    async fn handle_failure(&self, ctx: &RelayContext, channel: &Channel, error: &RelayError) {
        if error.is_local() {
            return;
        }
        if self.policy.should_retry(error.status_code(), false) {
            self.selector.cool_down(channel.id, self.policy.cooldown());
        }

        let RelayError::Upstream { status, error: upstream } = error else {
            return;
        };
        match self.health.report_failure(channel, upstream, *status).await {
            Ok(true) => {
                self.selector.set_status(channel.id, ChannelStatus::AutoDisabled);
                self.metrics.record_channel_disabled();
                info!(request_id = %ctx.request_id, channel_id = channel.id, "Channel auto-disabled");
            }
            Ok(false) => {}
            Err(e) => warn!(channel_id = channel.id, error = %e, "Failed to disable channel"),
        }
    }

    /// Shape the error the caller finally sees
    fn finalize(&self, ctx: &RelayContext, error: RelayError) -> RelayError {
        match error {
            RelayError::Upstream { status: 429, error } if !ctx.is_pinned() => RelayError::upstream(
                429,
                OpenAIError {
                    message: SATURATED_MESSAGE.to_string(),
                    ..error
                },
            ),
            other => other,
        }
    }

    async fn record_response_time(&self, channel: &Channel, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self.store.update_channel_response_time(channel.id, millis).await {
            warn!(channel_id = channel.id, error = %e, "Failed to record response time");
        }
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("selector", &self.selector)
            .field("policy", &self.policy)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RelayEngine`]
#[derive(Default)]
pub struct RelayEngineBuilder {
    store: Option<Arc<dyn Datastore>>,
    factory: Option<Arc<dyn AdaptorFactory>>,
    selector: Option<Arc<ChannelSelector>>,
    pricing: Option<Arc<ModelPricingTable>>,
    counter: Option<Arc<dyn TokenCounter>>,
    notifier: Option<Arc<dyn Notifier>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    metrics: Option<Arc<RelayMetrics>>,
    cache: Option<ResponseCache>,
    failover: FailoverConfig,
    health: HealthConfig,
    extra_reserve: i64,
}

impl RelayEngineBuilder {
    /// Datastore (required)
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Datastore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Adaptor factory (required)
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn AdaptorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Channel selector; an empty one is created otherwise
    #[must_use]
    pub fn selector(mut self, selector: Arc<ChannelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Pricing table; without one every model is unpriced
    #[must_use]
    pub fn pricing(mut self, pricing: Arc<ModelPricingTable>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Token counter
    #[must_use]
    pub fn counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Channel status notifications
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Object storage for image uploads
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Metrics registry
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Response cache; disabled otherwise
    #[must_use]
    pub fn cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Retry budget, cooldown and delay
    #[must_use]
    pub fn failover(mut self, failover: FailoverConfig) -> Self {
        self.failover = failover;
        self
    }

    /// Automatic disable and enable switches
    #[must_use]
    pub fn health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Additive reserve for token-priced requests
    #[must_use]
    pub fn extra_reserve(mut self, extra: i64) -> Self {
        self.extra_reserve = extra;
        self
    }

    /// Build the engine
    pub fn build(self) -> RelayResult<RelayEngine> {
        let store = self
            .store
            .ok_or_else(|| RelayError::internal("relay engine requires a datastore"))?;
        let factory = self
            .factory
            .ok_or_else(|| RelayError::internal("relay engine requires an adaptor factory"))?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                RelayMetrics::new().map_err(|e| RelayError::internal(e.to_string()))?,
            ),
        };
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        Ok(RelayEngine {
            meter: QuotaMeter::new(Arc::clone(&store), self.extra_reserve),
            health: ChannelHealth::new(Arc::clone(&store), notifier, self.health),
            store,
            selector: self.selector.unwrap_or_default(),
            factory,
            pricing: self.pricing.unwrap_or_default(),
            counter: self
                .counter
                .unwrap_or_else(|| Arc::new(EstimatingTokenCounter::new())),
            policy: FailoverPolicy::new(self.failover),
            cache: self
                .cache
                .unwrap_or_else(|| ResponseCache::in_memory(1, Duration::ZERO, false)),
            storage: self.storage,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{chat_body, harness, openai_channel};
    use pretty_assertions::assert_eq;
    use relay_core::{ChannelStatus, Price};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_builder_requires_store() {
        let err = RelayEngine::builder().build().unwrap_err();
        assert!(matches!(err, RelayError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_models_sorted_by_owner_then_id() {
        let server = MockServer::start().await;
        let channel = openai_channel(1, &server.uri())
            .with_models(["gpt-4o", "claude-3-haiku", "gpt-3.5-turbo"]);
        let h = harness(vec![channel], 0).await;
        h.engine.pricing().replace(
            vec![
                Price {
                    owned_by: Some("anthropic".to_string()),
                    ..Price::tokens("claude-3-haiku", 0.125, 0.625)
                },
                Price {
                    owned_by: Some("openai".to_string()),
                    ..Price::tokens("gpt-4o", 2.5, 7.5)
                },
            ],
            Default::default(),
        );

        let ids: Vec<(String, String)> = h
            .engine
            .models("default")
            .data
            .into_iter()
            .map(|m| (m.owned_by, m.id))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("anthropic".to_string(), "claude-3-haiku".to_string()),
                ("openai".to_string(), "gpt-4o".to_string()),
                ("relay".to_string(), "gpt-3.5-turbo".to_string()),
            ]
        );
        assert!(h.engine.model("default", "gpt-4o").is_ok());
        let missing = h.engine.model("default", "gpt-5").unwrap_err();
        assert_eq!(missing.status_code(), 404);
    }

    #[tokio::test]
    async fn test_pinned_channel_must_be_enabled() {
        let server = MockServer::start().await;
        let channel = openai_channel(1, &server.uri()).with_status(ChannelStatus::ManuallyDisabled);
        let h = harness(vec![channel], 2).await;
        let ctx = RelayContext::new(h.token(1_000)).with_pinned_channel(Some(1));

        let err = h.engine.chat(&ctx, chat_body(false)).await.unwrap_err();
        assert!(matches!(err, RelayError::Routing { .. }));

        let ctx = RelayContext::new(h.token(1_000)).with_pinned_channel(Some(99));
        let err = h.engine.chat(&ctx, chat_body(false)).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_final_rate_limit_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/c1/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Rate limit reached", "type": "requests", "code": "rate_limit_exceeded"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let h = harness(vec![openai_channel(1, &server.uri())], 3).await;

        let err = h
            .engine
            .chat(&RelayContext::new(h.token(1_000)), chat_body(false))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.to_string(), SATURATED_MESSAGE);
        assert!(h.engine.selector().is_cooling_down(1));
        assert_eq!(h.store.channel_status(1), Some(ChannelStatus::Enabled));
    }
}
