//! Response cache for chat completions.
//!
//! Tokens with caching enabled get identical requests answered from a stored
//! response. Entries are keyed by a fingerprint of the caller and the exact
//! request body, so two tokens never share answers.

use async_trait::async_trait;
use relay_core::{ChannelId, TokenId, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend failure
    #[error("cache backend error: {0}")]
    Backend(String),

    /// Entry could not be encoded or decoded
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Storage behind the response cache
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value for `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()>;

    /// Remove a value
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
    hits: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process backend with TTL expiry and least-hit eviction
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MemoryCacheBackend {
    /// Create a backend holding at most `max_entries`
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Live entry count
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the backend is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired() {
                entries.remove(key);
                return Ok(None);
            }
            entry.hits += 1;
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.is_expired());

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let to_remove = entries.len() + 1 - self.max_entries;
            let mut by_hits: Vec<(String, u64)> = entries.iter().map(|(k, v)| (k.clone(), v.hits)).collect();
            by_hits.sort_by_key(|(_, hits)| *hits);
            for (key, _) in by_hits.into_iter().take(to_remove) {
                entries.remove(&key);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                data: value,
                expires_at: Instant::now() + ttl,
                hits: 0,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A stored completion with the usage it was billed at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Owner of the token that produced the entry
    pub user_id: UserId,
    /// Token that produced the entry
    pub token_id: TokenId,
    /// Channel that served the original request
    pub channel_id: ChannelId,
    /// Caller-facing model
    pub model: String,
    /// Prompt tokens of the original request
    pub prompt_tokens: u32,
    /// Completion tokens of the original request
    pub completion_tokens: u32,
    /// Whether the original was streamed
    pub is_stream: bool,
    /// Raw wire output: the JSON body, or every SSE frame including `[DONE]`
    pub response: String,
}

/// Cache key for a caller and request body
#[must_use]
pub fn fingerprint(user_id: UserId, token_id: TokenId, request_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{user_id}-{token_id}-{request_json}"));
    hex::encode(hasher.finalize())
}

/// Fingerprint-keyed response cache
#[derive(Clone)]
pub struct ResponseCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    enabled: bool,
}

impl ResponseCache {
    /// Create a cache over `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration, enabled: bool) -> Self {
        Self { backend, ttl, enabled }
    }

    /// Memory-backed cache
    #[must_use]
    pub fn in_memory(max_entries: usize, ttl: Duration, enabled: bool) -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new(max_entries)), ttl, enabled)
    }

    /// Whether the cache is switched on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up an entry; backend and decoding failures read as a miss
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Response cache read failed");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => {
                debug!(key, "Response cache hit");
                Some(entry)
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable cache entry");
                let _ = self.backend.delete(key).await;
                None
            }
        }
    }

    /// Store an entry; failures are logged
    pub async fn put(&self, key: &str, entry: &CachedResponse) {
        if !self.enabled {
            return;
        }
        let result = match serde_json::to_vec(entry) {
            Ok(bytes) => self.backend.set(key, bytes, self.ttl).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(backend = self.backend.name(), error = %e, "Response cache write failed");
        }
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("backend", &self.backend.name())
            .field("ttl", &self.ttl)
            .field("enabled", &self.enabled)
            .finish()
    }
}
