//! Topic dimension resolver
//!
//! Maps a [`DimensionKey`] to the persistent `topic_id`.
//!
//! ```text
//!  resolve(key)
//!     │
//!     ├─ cache hit ──────────────────────────────> id
//!     │
//!     └─ per-key lock ─┬─ cache hit (filled by the lock holder) ─> id
//!                      ├─ store.find ─────────────────────────────> id, cached
//!                      └─ store.upsert ───────────────────────────> id, cached
//! ```
//!
//! The per-key lock keeps concurrent first resolutions of one key down to a
//! single store round-trip; the store's atomic upsert guarantees a single row
//! even across processes. Cache entries are never evicted.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{DimensionStore, RepositoryResult};
use crate::schema::DimensionKey;

/// Resolver statistics
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Served from memory
    pub cache_hits: AtomicU64,
    /// Found in the store
    pub store_hits: AtomicU64,
    /// Created through upsert
    pub creations: AtomicU64,
    /// Store errors
    pub failures: AtomicU64,
}

impl ResolverStats {
    /// Get cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let store_hits = self.store_hits.load(Ordering::Relaxed);
        let creations = self.creations.load(Ordering::Relaxed);
        let total = hits + store_hits + creations;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Cached dimension resolver
pub struct DimensionResolver {
    store: Arc<dyn DimensionStore>,
    cache: DashMap<DimensionKey, i64>,
    /// Keys currently being resolved against the store
    in_flight: DashMap<DimensionKey, Arc<Mutex<()>>>,
    stats: Arc<ResolverStats>,
}

impl DimensionResolver {
    /// Create a resolver with an empty cache
    pub fn new(store: Arc<dyn DimensionStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
            stats: Arc::new(ResolverStats::default()),
        }
    }

    /// Get resolver statistics.
    pub fn stats(&self) -> &Arc<ResolverStats> {
        &self.stats
    }

    /// Get number of cached dimensions.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Load every existing dimension into the cache
    pub async fn preload(&self) -> RepositoryResult<usize> {
        let dimensions = self.store.load_dimensions().await?;
        let count = dimensions.len();

        for (key, id) in dimensions {
            self.cache.insert(key, id);
        }

        if count > 0 {
            info!("Loaded {} dimensions from store", count);
        }

        Ok(count)
    }

    /// Cached id, if any; never touches the store
    pub fn cached(&self, key: &DimensionKey) -> Option<i64> {
        self.cache.get(key).map(|id| *id)
    }

    /// Resolve a key to its id, creating the dimension on first sight
    pub async fn resolve(&self, key: &DimensionKey) -> RepositoryResult<i64> {
        if let Some(id) = self.cached(key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let lock = self.in_flight.entry(key.clone()).or_default().value().clone();
        let _guard = lock.lock().await;

        // Another task may have finished while we waited
        if let Some(id) = self.cached(key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let result = self.resolve_in_store(key).await;
        if let Ok(id) = result {
            self.cache.insert(key.clone(), id);
        } else {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.in_flight.remove(key);

        result
    }

    async fn resolve_in_store(&self, key: &DimensionKey) -> RepositoryResult<i64> {
        if let Some(id) = self.store.find_dimension(key).await? {
            self.stats.store_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let id = self.store.upsert_dimension(key).await?;
        self.stats.creations.fetch_add(1, Ordering::Relaxed);
        debug!("Resolved new dimension {} -> {}", key, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OptionType;
    use crate::storage::memory::MemoryStore;
    use futures_util::future::join_all;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn option_key() -> DimensionKey {
        DimensionKey::new(
            "NSE_FO|43210",
            Some("NIFTY".into()),
            Some(OptionType::Call),
            Some(dec!(19950)),
        )
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let resolver = DimensionResolver::new(store.clone());

        let first = resolver.resolve(&option_key()).await.unwrap();
        let second = resolver.resolve(&option_key()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.dimension_count(), 1);
        assert_eq!(resolver.stats().creations.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.stats().cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(resolver.stats().hit_ratio(), 0.5);
    }

    #[test]
    fn test_hit_ratio_without_resolutions() {
        assert_eq!(ResolverStats::default().hit_ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_first_resolution_creates_one_row() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(20)));
        let resolver = Arc::new(DimensionResolver::new(store.clone()));

        let tasks = (0..16).map(|_| {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(&option_key()).await })
        });
        let ids: Vec<i64> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.dimension_count(), 1);
        assert_eq!(store.find_calls(), 1);
        assert_eq!(store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn test_absent_fields_are_distinct_keys() {
        let store = Arc::new(MemoryStore::new());
        let resolver = DimensionResolver::new(store.clone());

        let index = DimensionKey::new("index/NIFTY", Some("NIFTY".into()), None, None);
        let bare = DimensionKey::new("index/NIFTY", None, None, None);

        let a = resolver.resolve(&index).await.unwrap();
        let b = resolver.resolve(&bare).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.dimension_count(), 2);
    }

    #[tokio::test]
    async fn test_existing_row_is_found_not_created() {
        let store = Arc::new(MemoryStore::new());
        store.seed_dimension(option_key(), 7);
        let resolver = DimensionResolver::new(store.clone());

        assert_eq!(resolver.resolve(&option_key()).await.unwrap(), 7);
        assert_eq!(store.upsert_calls(), 0);
        assert_eq!(resolver.stats().store_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_preload_warms_cache() {
        let store = Arc::new(MemoryStore::new());
        store.seed_dimension(option_key(), 3);
        let resolver = DimensionResolver::new(store.clone());

        assert_eq!(resolver.preload().await.unwrap(), 1);
        assert_eq!(resolver.cache_size(), 1);
        assert_eq!(resolver.resolve(&option_key()).await.unwrap(), 3);
        assert_eq!(store.find_calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        store.fail_dimension(option_key());
        let resolver = DimensionResolver::new(store.clone());

        assert!(resolver.resolve(&option_key()).await.is_err());
        assert_eq!(resolver.cache_size(), 0);
        assert_eq!(resolver.stats().failures.load(Ordering::Relaxed), 1);
    }
}
