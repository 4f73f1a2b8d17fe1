//! Expiring cache for derived credentials (signed tokens, exchanged access
//! tokens, signed URLs).
//!
//! Each key has its own async lock, so concurrent callers for one key wait for
//! a single regeneration instead of racing, while different keys never block
//! each other.

use dashmap::DashMap;
use relay_core::RelayResult;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct CachedCredential<T> {
    value: T,
    expires_at: Instant,
}

type Slot<T> = Arc<Mutex<Option<CachedCredential<T>>>>;

/// Keyed cache of expiring credentials
pub struct CredentialCache<T> {
    entries: DashMap<String, Slot<T>>,
}

impl<T: Clone + Send> CredentialCache<T> {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the cached credential for `key`, regenerating it when missing or
    /// expired. `refresh` returns the new value and how long it stays valid.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F) -> RelayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<(T, Duration)>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        debug!(key = %key, "Regenerating derived credential");
        let (value, ttl) = refresh().await?;
        *guard = Some(CachedCredential {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(value)
    }

    /// Drop the cached credential for `key`
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Number of keys tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot(&self, key: &str) -> Slot<T> {
        if let Some(slot) = self.entries.get(key) {
            return slot.clone();
        }
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }
}

impl<T: Clone + Send> Default for CredentialCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CredentialCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("keys", &self.entries.len())
            .finish()
    }
}
