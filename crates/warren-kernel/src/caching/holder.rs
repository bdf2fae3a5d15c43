//! Cache partitioning.
//!
//! A [`CacheHolder`] owns every cache in the process, partitioned by (owning
//! component type, key type, result type), so identically-typed but
//! semantically distinct caches never collide. A [`CacheManager`] is the
//! per-component facade handed to runtime components.

use std::any::{Any, TypeId};
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use super::cache::{AcquireContext, Cache, TokenSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PartitionKey {
    component: TypeId,
    key: TypeId,
    result: TypeId,
}

/// Process-wide registry of caches.
pub struct CacheHolder {
    caches: DashMap<PartitionKey, Arc<dyn Any + Send + Sync>>,
}

impl CacheHolder {
    pub fn new() -> Self {
        Self {
            caches: DashMap::new(),
        }
    }

    /// The cache for `(component, K, V)`, created on first use.
    pub fn cache<K, V>(&self, component: TypeId) -> Arc<Cache<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let partition = PartitionKey {
            component,
            key: TypeId::of::<K>(),
            result: TypeId::of::<V>(),
        };
        let entry = self
            .caches
            .entry(partition)
            .or_insert_with(|| Arc::new(Cache::<K, V>::new()))
            .clone();
        // The partition key pins K and V, so the downcast cannot fail.
        entry
            .downcast::<Cache<K, V>>()
            .unwrap_or_else(|_| Arc::new(Cache::new()))
    }
}

impl Default for CacheHolder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-component cache facade bound to one owning component type.
#[derive(Clone)]
pub struct CacheManager {
    component: TypeId,
    holder: Arc<CacheHolder>,
}

impl CacheManager {
    /// A manager whose caches are owned by component type `C`.
    pub fn new<C: 'static>(holder: Arc<CacheHolder>) -> Self {
        Self {
            component: TypeId::of::<C>(),
            holder,
        }
    }

    pub fn get<K, V, F>(&self, key: K, acquire: F) -> V
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(&mut AcquireContext) -> V,
    {
        self.holder.cache::<K, V>(self.component).get(key, acquire)
    }

    pub fn get_within<K, V, F>(&self, sink: &mut dyn TokenSink, key: K, acquire: F) -> V
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(&mut AcquireContext) -> V,
    {
        self.holder
            .cache::<K, V>(self.component)
            .get_within(sink, key, acquire)
    }

    pub fn try_get_within<K, V, F, E>(
        &self,
        sink: &mut dyn TokenSink,
        key: K,
        acquire: F,
    ) -> Result<V, E>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(&mut AcquireContext) -> Result<V, E>,
    {
        self.holder
            .cache::<K, V>(self.component)
            .try_get_within(sink, key, acquire)
    }
}
