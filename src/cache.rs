//! Optimistic write-through caching for small, frequently-updated entities.
//!
//! The store is key-addressed and single-writer: every mutation goes through
//! [`OptimisticCache::apply`], which installs the new value locally before the
//! server confirms it, rolls back on failure, and lets the last-submitted
//! write win when the user changes their mind before the first save lands.
//! Views derived from an entity (a trend chart, a summary card) register a
//! [`DerivedView`] staleness flag and are refetched lazily after a successful
//! write. The entity's own slot is never refetched, since the write already
//! installed the authoritative response.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ApiError;

/// Staleness flag shared between a cache and the view it invalidates.
#[derive(Clone, Default)]
pub struct DerivedView {
    stale: Arc<AtomicBool>,
}

impl DerivedView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.stale.store(false, Ordering::SeqCst);
    }
}

/// A read-model refreshed only when empty or marked stale.
pub struct CachedView<V> {
    value: RwLock<Option<V>>,
    flag: DerivedView,
}

impl<V: Clone> CachedView<V> {
    pub fn new() -> Self {
        Self {
            value: RwLock::new(None),
            flag: DerivedView::new(),
        }
    }

    /// Handle to register with the cache that invalidates this view.
    pub fn flag(&self) -> DerivedView {
        self.flag.clone()
    }

    pub async fn peek(&self) -> Option<V> {
        self.value.read().await.clone()
    }

    /// Return the cached value, fetching only when the view is empty or has
    /// been marked stale by a write to the entity it derives from.
    pub async fn get_or_refresh<F>(&self, fetch: F) -> Result<V, ApiError>
    where
        F: Future<Output = Result<V, ApiError>>,
    {
        if !self.flag.is_stale() {
            if let Some(value) = self.value.read().await.clone() {
                return Ok(value);
            }
        }

        let fresh = fetch.await?;
        *self.value.write().await = Some(fresh.clone());
        self.flag.clear();
        Ok(fresh)
    }
}

impl<V: Clone> Default for CachedView<V> {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot<V> {
    server_value: Option<V>,
    local_shadow: Option<V>,
    in_flight: bool,
    write_seq: u64,
    read_epoch: u64,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            server_value: None,
            local_shadow: None,
            in_flight: false,
            write_seq: 0,
            read_epoch: 0,
        }
    }
}

/// Key-addressed optimistic store. See the module docs for the policy.
pub struct OptimisticCache<V> {
    slots: RwLock<HashMap<String, Slot<V>>>,
    dependents: RwLock<HashMap<String, Vec<DerivedView>>>,
}

impl<V: Clone + Send + Sync> OptimisticCache<V> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            dependents: RwLock::new(HashMap::new()),
        }
    }

    /// Register a derived view to be marked stale whenever a write to `key`
    /// succeeds.
    pub async fn register_dependent(&self, key: &str, view: DerivedView) {
        self.dependents
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(view);
    }

    /// Current visible value: the optimistic shadow when a write is in
    /// flight, the last confirmed server value otherwise.
    pub async fn get(&self, key: &str) -> Option<V> {
        let slots = self.slots.read().await;
        let slot = slots.get(key)?;
        slot.local_shadow
            .clone()
            .or_else(|| slot.server_value.clone())
    }

    pub async fn in_flight(&self, key: &str) -> bool {
        self.slots
            .read()
            .await
            .get(key)
            .map(|slot| slot.in_flight)
            .unwrap_or(false)
    }

    /// Optimistically write `new_value`, confirmed by awaiting `persist`.
    ///
    /// The shadow is installed before the await; competing reads for the key
    /// are logically cancelled (their results will not install). On success
    /// the server value becomes the persist result and dependents go stale;
    /// on failure the pre-apply server value is restored and the error
    /// surfaces to the caller, unretried. If a newer `apply` for the same key
    /// started while this one was awaiting, the late result (success or
    /// failure) leaves the slot untouched: last submitted wins.
    pub async fn apply<F>(&self, key: &str, new_value: V, persist: F) -> Result<V, ApiError>
    where
        F: Future<Output = Result<V, ApiError>>,
    {
        let (snapshot, my_seq) = {
            let mut slots = self.slots.write().await;
            let slot = slots.entry(key.to_string()).or_default();
            let snapshot = slot.server_value.clone();
            slot.read_epoch += 1;
            slot.local_shadow = Some(new_value);
            slot.in_flight = true;
            slot.write_seq += 1;
            (snapshot, slot.write_seq)
        };

        let result = persist.await;

        {
            let mut slots = self.slots.write().await;
            let slot = slots.entry(key.to_string()).or_default();
            if slot.write_seq != my_seq {
                tracing::debug!("Write to '{}' superseded; dropping late result", key);
                return result;
            }

            match &result {
                Ok(value) => {
                    slot.server_value = Some(value.clone());
                    slot.local_shadow = None;
                    slot.in_flight = false;
                }
                Err(error) => {
                    tracing::warn!("Write to '{}' failed, rolling back: {}", key, error);
                    slot.server_value = snapshot;
                    slot.local_shadow = None;
                    slot.in_flight = false;
                }
            }
        }

        if result.is_ok() {
            self.mark_dependents_stale(key).await;
        }
        result
    }

    /// Epoch observed by a read before it hits the network; pass it back to
    /// [`install_if_current`](Self::install_if_current).
    pub async fn read_epoch(&self, key: &str) -> u64 {
        self.slots
            .read()
            .await
            .get(key)
            .map(|slot| slot.read_epoch)
            .unwrap_or(0)
    }

    /// Install a fetched server value unless a write bumped the epoch while
    /// the read was outstanding. Returns whether the value was installed.
    pub async fn install_if_current(&self, key: &str, epoch: u64, value: Option<V>) -> bool {
        let mut slots = self.slots.write().await;
        let slot = slots.entry(key.to_string()).or_default();
        if slot.read_epoch != epoch {
            tracing::debug!("Read of '{}' cancelled by a concurrent write", key);
            return false;
        }
        slot.server_value = value;
        true
    }

    /// Read-through: return the visible value, fetching from the server only
    /// when the slot is empty. A write racing the fetch wins: the fetched
    /// value is discarded and the optimistic value is returned instead.
    pub async fn fetch_with<F>(&self, key: &str, fetch: F) -> Result<Option<V>, ApiError>
    where
        F: Future<Output = Result<Option<V>, ApiError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        let epoch = self.read_epoch(key).await;
        let fetched = fetch.await?;
        if self.install_if_current(key, epoch, fetched.clone()).await {
            Ok(fetched)
        } else {
            Ok(self.get(key).await)
        }
    }

    async fn mark_dependents_stale(&self, key: &str) {
        if let Some(views) = self.dependents.read().await.get(key) {
            for view in views {
                view.mark_stale();
            }
        }
    }
}

impl<V: Clone + Send + Sync> Default for OptimisticCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
