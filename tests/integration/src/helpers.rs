//! Test relay wired the same way the binary wires it, listening on a free port

use once_cell::sync::Lazy;
use relay_billing::ModelPricingTable;
use relay_config::{parse, RelayConfig};
use relay_core::MemoryDatastore;
use relay_engine::RelayEngine;
use relay_providers::{DefaultAdaptorFactory, HttpRequester, ProviderContext, RequesterConfig};
use relay_resilience::{FailoverConfig, HealthConfig, ResponseCache};
use relay_routing::ChannelSelector;
use relay_server::{AppState, Server, ShutdownCoordinator};
use reqwest::{Client, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Key of the token every fixture config defines
pub const TEST_KEY: &str = "sk-relay-test";

static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
});

/// Initialize tracing for tests when `TEST_LOG` is set
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// A running relay
pub struct TestRelay {
    /// Base URL, `http://127.0.0.1:<port>`
    pub base_url: String,
    /// HTTP client
    pub client: Client,
    /// Datastore backing the relay
    pub store: Arc<MemoryDatastore>,
    /// The engine, for direct inspection
    pub engine: Arc<RelayEngine>,
    shutdown: ShutdownCoordinator,
}

impl TestRelay {
    /// Start a relay from YAML config text
    pub async fn from_yaml(yaml: &str) -> Self {
        let config = parse(yaml, "yaml").expect("config parses");
        Self::start(config).await
    }

    /// Start a relay for `config`, ignoring its host and port
    pub async fn start(config: RelayConfig) -> Self {
        init_tracing();

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

        let requester = Arc::new(
            HttpRequester::new(
                RequesterConfig::default()
                    .with_timeout(config.relay.request_timeout)
                    .with_connect_timeout(config.relay.connect_timeout),
            )
            .expect("requester"),
        );
        let selector = Arc::new(ChannelSelector::with_seed(11));
        selector.refresh(store.as_ref()).await.expect("index");

        let engine = RelayEngine::builder()
            .store(store.clone())
            .factory(Arc::new(DefaultAdaptorFactory::new(ProviderContext::new(requester))))
            .selector(selector)
            .pricing(Arc::new(ModelPricingTable::new(
                config.billing.prices.clone(),
                config.billing.group_ratios.clone(),
            )))
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
            .build()
            .expect("engine");
        let engine = Arc::new(engine);

        let mut server_config = config.server.clone();
        server_config.host = "127.0.0.1".to_string();
        server_config.port = 0;
        server_config.shutdown_timeout = Duration::from_secs(1);
        let server = Server::new(server_config, AppState::new(Arc::clone(&engine)));
        let shutdown = server.shutdown_handle();
        let listener = server.bind().await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(server.serve(listener));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            store,
            engine,
            shutdown,
        }
    }

    /// Full URL for a path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with the test key
    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .bearer_auth(TEST_KEY)
            .send()
            .await
            .expect("request failed")
    }

    /// GET without credentials
    pub async fn get_anonymous(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request failed")
    }

    /// POST JSON with the test key
    pub async fn post_json(&self, path: &str, body: &Value) -> Response {
        self.post_json_with_headers(path, body, &[]).await
    }

    /// POST JSON with the test key and extra headers
    pub async fn post_json_with_headers(
        &self,
        path: &str,
        body: &Value,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = self.client.post(self.url(path)).bearer_auth(TEST_KEY).json(body);
        for (key, value) in headers {
            builder = builder.header(*key, *value);
        }
        builder.send().await.expect("request failed")
    }

    /// Parse a response body as JSON
    pub async fn json_body(response: Response) -> Value {
        response.json().await.expect("JSON body")
    }

    /// Remaining quota of token 1
    pub fn quota(&self) -> i64 {
        self.store.token_quota(1).expect("token 1 exists")
    }

    /// Remaining quota of user 1, the test token's owner
    pub fn user_quota(&self) -> i64 {
        self.store.user_quota(1).expect("user 1 exists")
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.trigger("test finished");
    }
}

/// Assert a response status, printing the body on mismatch
pub async fn expect_status(response: Response, expected: u16) -> Response {
    let status = response.status().as_u16();
    if status == expected {
        return response;
    }
    let body = response.text().await.unwrap_or_default();
    panic!("expected status {expected}, got {status}: {body}");
}
