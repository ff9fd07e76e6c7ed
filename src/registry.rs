//! Locate-or-spawn registry for per-aggregate singleton actors.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::actor::{AggregateHandle, spawn_actor};
use crate::aggregate::Aggregate;
use crate::error::SpawnError;
use crate::store::EventStore;

/// Type-erased handle cache keyed by `(aggregate_type, instance_id)`.
///
/// `Box<dyn Any + Send + Sync>` lets a single map hold `AggregateHandle<A>`
/// for any concrete `A`. Downcasting recovers the typed handle.
type HandleCache = HashMap<(&'static str, String), Box<dyn Any + Send + Sync>>;

/// Registry guaranteeing at-most-one live actor per `(aggregate_type,
/// instance_id)` within the process.
///
/// Cloning shares the underlying cache. Concurrent callers asking for the
/// same aggregate receive handles to the same actor; a dead actor (stopped
/// or crashed) is transparently respawned on the next request, reloading its
/// full history before any command is delivered.
#[derive(Clone)]
pub struct AggregateRegistry {
    store: Arc<dyn EventStore>,
    cache: Arc<RwLock<HandleCache>>,
}

impl std::fmt::Debug for AggregateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRegistry").finish_non_exhaustive()
    }
}

impl AggregateRegistry {
    /// Create a registry spawning actors against the given store.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a handle to an aggregate instance, spawning its actor if needed.
    ///
    /// The write lock is held across the spawn, so two concurrent callers
    /// can never each spawn an actor for the same aggregate: the loser of
    /// the race observes the winner's cached handle on re-check.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] if recovering the aggregate's state from the
    /// store fails.
    pub async fn get_or_start<A: Aggregate>(
        &self,
        instance_id: &str,
    ) -> Result<AggregateHandle<A>, SpawnError> {
        let key = (A::AGGREGATE_TYPE, instance_id.to_owned());

        // Fast path: check the cache with a read lock.
        {
            let cache = self.cache.read().await;
            if let Some(boxed) = cache.get(&key)
                && let Some(handle) = boxed.downcast_ref::<AggregateHandle<A>>()
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        // Slow path: take the write lock, re-check (another caller may have
        // spawned while we waited), evict any stale entry, spawn.
        let mut cache = self.cache.write().await;
        if let Some(boxed) = cache.get(&key)
            && let Some(handle) = boxed.downcast_ref::<AggregateHandle<A>>()
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        cache.remove(&key);

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id = %instance_id,
            "spawning actor"
        );
        let handle = spawn_actor::<A>(self.store.clone(), instance_id).await?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// The store this registry spawns actors against.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }
}
