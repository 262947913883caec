//! Keyed memoization for derived forecast series.
//!
//! Entries are keyed by input fingerprints and expire on TTL. A per-key
//! build lock guarantees at most one concurrent computation: a request
//! arriving while a build is in flight waits on the same lock and then
//! reads the freshly stored value.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct CacheSlot<V> {
    value: Mutex<Option<(Instant, V)>>,
}

pub struct KeyedCache<V> {
    slots: Mutex<HashMap<u64, Arc<CacheSlot<V>>>>,
}

impl<V: Clone> KeyedCache<V> {
    pub fn new() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }

    /// Return the cached value for `key` if younger than `ttl`, otherwise
    /// run `build` and store its result.
    pub async fn get_or_build<F, Fut>(&self, key: u64, ttl: Duration, build: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(
                slots
                    .entry(key)
                    .or_insert_with(|| Arc::new(CacheSlot { value: Mutex::new(None) })),
            )
        };

        // The per-key lock is held across the build: joiners queue here.
        let mut guard = slot.value.lock().await;
        if let Some((stored_at, value)) = guard.as_ref() {
            if stored_at.elapsed() < ttl {
                return value.clone();
            }
        }
        let value = build().await;
        *guard = Some((Instant::now(), value.clone()));
        value
    }

    /// Drop every entry. Used on reconfiguration and day rollover; keys
    /// embed input fingerprints, so stale keys are otherwise unreachable
    /// and would only accumulate.
    pub async fn purge(&self) {
        self.slots.lock().await.clear();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl<V: Clone> Default for KeyedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
