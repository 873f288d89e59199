use std::sync::Arc;

use witchcraft_metrics::{Counter, MetricRegistry};

/// Passive counters around the cache. Registered under `strata.cache.*` in
/// the registry the cache was built with; an exporter, if any, is the
/// embedding engine's concern.
pub struct CacheMetrics {
    pub(crate) hits: Arc<Counter>,
    pub(crate) misses: Arc<Counter>,
    pub(crate) stores: Arc<Counter>,
    pub(crate) collisions: Arc<Counter>,
    pub(crate) evictions: Arc<Counter>,
}

impl CacheMetrics {
    /// Create the counters in `registry`.
    pub fn new(registry: &MetricRegistry) -> Self {
        Self {
            hits: registry.counter("strata.cache.hits"),
            misses: registry.counter("strata.cache.misses"),
            stores: registry.counter("strata.cache.stores"),
            collisions: registry.counter("strata.cache.collisions"),
            evictions: registry.counter("strata.cache.evictions"),
        }
    }

    /// Probe ranges answered from the cache.
    pub fn hit_count(&self) -> i64 {
        self.hits.count()
    }

    /// Probe ranges that came back as gaps.
    pub fn miss_count(&self) -> i64 {
        self.misses.count()
    }

    /// Buffers accepted into the index.
    pub fn store_count(&self) -> i64 {
        self.stores.count()
    }

    /// Publish races lost to a concurrent producer.
    pub fn collision_count(&self) -> i64 {
        self.collisions.count()
    }

    /// Buffers invalidated by the policy.
    pub fn eviction_count(&self) -> i64 {
        self.evictions.count()
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new(&MetricRegistry::default())
    }
}
