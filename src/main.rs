//! # LLM Relay
//!
//! OpenAI-compatible relay in front of many LLM providers.
//!
//! ## Features
//!
//! - One API surface for OpenAI, Azure, Anthropic, Bedrock, Baidu, Zhipu and more
//! - Channel selection by group, model, priority and weight with failover
//! - Quota reservation and settlement per token
//! - Automatic channel disable and re-enable from error classification
//! - Prometheus metrics and structured logging
//!
//! ## Usage
//!
//! ```bash
//! # Start with ./config.yaml when present, defaults otherwise
//! llm-relay
//!
//! # Start with a specific config file
//! RELAY_CONFIG=/etc/llm-relay/config.toml llm-relay
//!
//! # Override single settings
//! RELAY_PORT=9000 RELAY_RETRY_TIMES=2 llm-relay
//! ```

use anyhow::Context;
use relay_billing::ModelPricingTable;
use relay_config::{load_config, RelayConfig};
use relay_core::MemoryDatastore;
use relay_engine::{spawn_maintenance, RelayEngine};
use relay_providers::{DefaultAdaptorFactory, HttpRequester, ProviderContext, RequesterConfig};
use relay_resilience::{FailoverConfig, HealthConfig, ResponseCache};
use relay_routing::{bootstrap, ChannelSelector};
use relay_server::{AppState, Server};
use relay_telemetry::{init_logging, LoggingConfig};
use std::sync::Arc;
use tracing::{error, info};

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be up yet when configuration fails.
        eprintln!("llm-relay failed: {e:#}");
        error!(error = %format!("{e:#}"), "Application failed");
        std::process::exit(1);
    }
}

/// Main application logic
async fn run() -> anyhow::Result<()> {
    let config = load_config().await.context("loading configuration")?;

    init_logging(
        &LoggingConfig::new()
            .with_level(config.logging.level.clone())
            .with_json(config.logging.json),
    )?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "Starting LLM relay"
    );

    let store = seed_datastore(&config);

    let mut requester_config = RequesterConfig::default()
        .with_timeout(config.relay.request_timeout)
        .with_connect_timeout(config.relay.connect_timeout);
    if let Some(proxy) = &config.relay.proxy {
        requester_config = requester_config.with_proxy(proxy.clone());
    }
    let requester = Arc::new(HttpRequester::new(requester_config)?);
    let factory = Arc::new(DefaultAdaptorFactory::new(ProviderContext::new(requester)));

    let pricing = Arc::new(ModelPricingTable::new(
        config.billing.prices.clone(),
        config.billing.group_ratios.clone(),
    ));

    let selector = Arc::new(ChannelSelector::new());
    bootstrap(&selector, store.as_ref()).await?;
    let _refresh = selector.spawn_refresh(store.clone(), config.relay.channel_refresh_interval);

    let engine = RelayEngine::builder()
        .store(store)
        .factory(factory)
        .selector(selector)
        .pricing(pricing)
        .cache(ResponseCache::in_memory(
            config.cache.max_entries,
            config.cache.ttl,
            config.cache.enabled,
        ))
        .failover(FailoverConfig {
            retry_times: config.relay.retry_times,
            cooldown: config.relay.retry_cooldown,
            delay: config.relay.retry_delay,
            ..FailoverConfig::default()
        })
        .health(HealthConfig {
            automatic_disable: config.relay.automatic_disable_channel,
            automatic_enable: config.relay.automatic_enable_channel,
        })
        .extra_reserve(config.relay.pre_consumed_quota)
        .build()?;
    let engine = Arc::new(engine);

    let _maintenance = spawn_maintenance(
        Arc::clone(&engine),
        config.relay.channel_test_interval,
        config.relay.balance_update_interval,
    );

    let server = Server::new(config.server.clone(), AppState::new(engine));
    let _signals = server.shutdown_handle().listen_for_signals();
    server.run().await?;

    Ok(())
}

/// In-memory datastore holding the configured channels, users and tokens
fn seed_datastore(config: &RelayConfig) -> Arc<MemoryDatastore> {
    let store = MemoryDatastore::shared();
    for channel in &config.channels {
        store.upsert_channel(channel.to_channel());
    }
    for user in &config.users {
        store.upsert_user(user.clone());
    }
    for token in &config.tokens {
        store.upsert_token(token.clone());
    }
    info!(
        channels = config.channels.len(),
        users = config.users.len(),
        tokens = config.tokens.len(),
        "Datastore seeded"
    );
    store
}
