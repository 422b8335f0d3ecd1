//! Storage layer for LTP readings
//!
//! The dimension table (`topics`) maps a composite key to a stable id; the
//! reading table (`ltp_data`) is append-only and references it. Both are
//! reached through the [`DimensionStore`] and [`ReadingSink`] traits so the
//! resolver and batch writer run unchanged against Postgres or memory.

mod batch;
mod dimension;
pub mod memory;
mod migrations;
mod repository;

pub use batch::*;
pub use dimension::*;
pub use migrations::*;
pub use repository::*;

use async_trait::async_trait;

use crate::schema::{DimensionKey, ReadingRow};

/// Persistent side of the dimension resolver
#[async_trait]
pub trait DimensionStore: Send + Sync {
    /// Every known dimension, used to warm the cache at startup
    async fn load_dimensions(&self) -> RepositoryResult<Vec<(DimensionKey, i64)>>;

    /// Look up an existing dimension
    async fn find_dimension(&self, key: &DimensionKey) -> RepositoryResult<Option<i64>>;

    /// Insert the dimension if absent and return its id either way
    ///
    /// Must be atomic: concurrent calls for one key yield one row.
    async fn upsert_dimension(&self, key: &DimensionKey) -> RepositoryResult<i64>;
}

/// Destination of flushed readings
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Insert all rows in one transaction; either every row lands or none does
    async fn insert_readings(&self, rows: &[ReadingRow]) -> RepositoryResult<u64>;
}
