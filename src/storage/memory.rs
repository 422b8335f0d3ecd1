//! In-memory store
//!
//! Backs `serve --dry-run` and the test suites. Dimension upserts are atomic
//! under one lock; reading inserts are all-or-nothing like a transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::{DimensionStore, ReadingSink, RepositoryError, RepositoryResult};
use crate::schema::{DimensionKey, ReadingRow};

#[derive(Default)]
struct Tables {
    dimensions: HashMap<DimensionKey, i64>,
    next_id: i64,
    readings: Vec<ReadingRow>,
}

/// Store keeping both tables in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Artificial latency applied to every store call
    latency: Option<Duration>,
    failing_keys: Mutex<HashSet<DimensionKey>>,
    failing_inserts: AtomicU32,
    rejected_inserts: AtomicU32,
    find_calls: AtomicU64,
    upsert_calls: AtomicU64,
    insert_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, widening race windows in concurrency tests
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Seed an existing dimension row
    pub fn seed_dimension(&self, key: DimensionKey, id: i64) {
        let mut tables = self.tables.lock();
        tables.next_id = tables.next_id.max(id);
        tables.dimensions.insert(key, id);
    }

    /// Make lookups and upserts for this key fail
    pub fn fail_dimension(&self, key: DimensionKey) {
        self.failing_keys.lock().insert(key);
    }

    /// Make the next `n` reading inserts fail
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reading inserts fail with a non-retryable error
    pub fn fail_next_inserts_permanently(&self, n: u32) {
        self.rejected_inserts.store(n, Ordering::SeqCst);
    }

    pub fn dimension_count(&self) -> usize {
        self.tables.lock().dimensions.len()
    }

    pub fn dimension_id(&self, key: &DimensionKey) -> Option<i64> {
        self.tables.lock().dimensions.get(key).copied()
    }

    /// All committed readings in insertion order
    pub fn readings(&self) -> Vec<ReadingRow> {
        self.tables.lock().readings.clone()
    }

    pub fn find_calls(&self) -> u64 {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Number of insert transactions attempted, failed ones included
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_key(&self, key: &DimensionKey) -> RepositoryResult<()> {
        if self.failing_keys.lock().contains(key) {
            return Err(RepositoryError::InvalidData(format!(
                "dimension {} rejected",
                key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DimensionStore for MemoryStore {
    async fn load_dimensions(&self) -> RepositoryResult<Vec<(DimensionKey, i64)>> {
        self.simulate_latency().await;
        Ok(self
            .tables
            .lock()
            .dimensions
            .iter()
            .map(|(key, id)| (key.clone(), *id))
            .collect())
    }

    async fn find_dimension(&self, key: &DimensionKey) -> RepositoryResult<Option<i64>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_key(key)?;
        Ok(self.tables.lock().dimensions.get(key).copied())
    }

    async fn upsert_dimension(&self, key: &DimensionKey) -> RepositoryResult<i64> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_key(key)?;

        let mut tables = self.tables.lock();
        if let Some(id) = tables.dimensions.get(key) {
            return Ok(*id);
        }
        tables.next_id += 1;
        let id = tables.next_id;
        tables.dimensions.insert(key.clone(), id);
        Ok(id)
    }
}

#[async_trait]
impl ReadingSink for MemoryStore {
    async fn insert_readings(&self, rows: &[ReadingRow]) -> RepositoryResult<u64> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        let rejected = self
            .rejected_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if rejected.is_ok() {
            return Err(RepositoryError::InvalidData("insert rejected".to_string()));
        }

        let mut tables = self.tables.lock();
        // Same foreign key as ltp_data.topic_id
        let known: HashSet<i64> = tables.dimensions.values().copied().collect();
        if let Some(orphan) = rows.iter().find(|r| !known.contains(&r.dimension_id)) {
            return Err(RepositoryError::InvalidData(format!(
                "unknown dimension id {}",
                orphan.dimension_id
            )));
        }

        tables.readings.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn key(topic: &str) -> DimensionKey {
        DimensionKey::new(topic, None, None, None)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.upsert_dimension(&key("a")).await.unwrap();
        let again = store.upsert_dimension(&key("a")).await.unwrap();
        let other = store.upsert_dimension(&key("b")).await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(store.dimension_count(), 2);
    }

    #[tokio::test]
    async fn test_insert_is_all_or_nothing() {
        let store = MemoryStore::new();
        let id = store.upsert_dimension(&key("a")).await.unwrap();
        let rows = vec![
            ReadingRow {
                dimension_id: id,
                value: dec!(1.00),
                observed_at: Utc::now(),
            },
            ReadingRow {
                dimension_id: id + 100,
                value: dec!(2.00),
                observed_at: Utc::now(),
            },
        ];

        assert!(store.insert_readings(&rows).await.is_err());
        assert!(store.readings().is_empty());

        assert_eq!(store.insert_readings(&rows[..1]).await.unwrap(), 1);
        assert_eq!(store.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.fail_next_inserts(1);
        assert!(store.insert_readings(&[]).await.is_err());
        assert!(store.insert_readings(&[]).await.is_ok());
        assert_eq!(store.insert_calls(), 2);

        store.fail_dimension(key("bad"));
        assert!(store.find_dimension(&key("bad")).await.is_err());
        assert!(store.upsert_dimension(&key("bad")).await.is_err());
    }

    #[tokio::test]
    async fn test_seeded_ids_do_not_collide() {
        let store = MemoryStore::new();
        store.seed_dimension(key("old"), 41);
        let id = store.upsert_dimension(&key("new")).await.unwrap();
        assert_eq!(id, 42);
        assert_eq!(store.load_dimensions().await.unwrap().len(), 2);
    }
}
