//! Postgres repository
//!
//! Implements [`DimensionStore`] and [`ReadingSink`] on top of an sqlx pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::{DimensionStore, ReadingSink};
use crate::config::DatabaseSettings;
use crate::error::{ErrorCategory, ErrorClassification};
use crate::schema::{DimensionKey, OptionType, ReadingRow};

/// Rows per INSERT statement (3 bind parameters each, well under the 65535 limit)
const INSERT_CHUNK_SIZE: usize = 1000;

/// Repository errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl ErrorClassification for RepositoryError {
    fn category(&self) -> ErrorCategory {
        match self {
            // Constraint violations fail the same way on every attempt
            RepositoryError::Database(sqlx::Error::Database(e)) if e.constraint().is_some() => {
                ErrorCategory::Permanent
            }
            RepositoryError::Database(_) => ErrorCategory::Transient,
            RepositoryError::Configuration(_) => ErrorCategory::Configuration,
            RepositoryError::NotFound(_) => ErrorCategory::Permanent,
            RepositoryError::InvalidData(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            RepositoryError::Database(_) => Some(Duration::from_millis(500)),
            _ => None,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Postgres-backed LTP repository
#[derive(Clone)]
pub struct LtpRepository {
    pool: PgPool,
}

impl LtpRepository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new repository from settings
    pub async fn from_settings(settings: &DatabaseSettings) -> RepositoryResult<Self> {
        if settings.url.is_empty() {
            return Err(RepositoryError::Configuration(
                "database.url is empty".to_string(),
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.url)
            .await?;

        Ok(Self::new(pool))
    }

    /// Get the database pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections to return
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Dimension and reading counts
    pub async fn get_database_stats(&self) -> RepositoryResult<DatabaseStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM topics) AS total_dimensions,
                COUNT(*) AS total_readings,
                MIN(observed_at) AS earliest_time,
                MAX(observed_at) AS latest_time
            FROM ltp_data
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            total_dimensions: row.get::<i64, _>("total_dimensions") as u64,
            total_readings: row.get::<i64, _>("total_readings") as u64,
            earliest_time: row.get("earliest_time"),
            latest_time: row.get("latest_time"),
        })
    }

    /// Latest stored value per dimension of one index
    pub async fn get_latest_by_index(&self, index: &str) -> RepositoryResult<Vec<LatestReading>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (t.topic_id)
                t.topic_name, t.option_type, t.strike, d.ltp, d.observed_at
            FROM topics t
            JOIN ltp_data d ON d.topic_id = t.topic_id
            WHERE t.index_name = $1
            ORDER BY t.topic_id, d.observed_at DESC
            "#,
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LatestReading {
                topic: row.get("topic_name"),
                option_type: row
                    .get::<Option<String>, _>("option_type")
                    .as_deref()
                    .and_then(OptionType::from_str),
                strike: row.get("strike"),
                value: row.get("ltp"),
                observed_at: row.get("observed_at"),
            })
            .collect())
    }

    async fn insert_chunk(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        rows: &[ReadingRow],
    ) -> RepositoryResult<u64> {
        let mut query = String::from("INSERT INTO ltp_data (topic_id, ltp, observed_at) VALUES ");

        for i in 0..rows.len() {
            if i > 0 {
                query.push_str(", ");
            }
            let base = i * 3;
            query.push_str(&format!("(${}, ${}, ${})", base + 1, base + 2, base + 3));
        }

        let mut sqlx_query = sqlx::query(&query);
        for row in rows {
            sqlx_query = sqlx_query
                .bind(row.dimension_id)
                .bind(row.value)
                .bind(row.observed_at);
        }

        let result = sqlx_query.execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DimensionStore for LtpRepository {
    async fn load_dimensions(&self) -> RepositoryResult<Vec<(DimensionKey, i64)>> {
        let rows: Vec<(i64, String, Option<String>, Option<String>, Option<Decimal>)> =
            sqlx::query_as(
                "SELECT topic_id, topic_name, index_name, option_type, strike FROM topics",
            )
            .fetch_all(&self.pool)
            .await?;

        let mut dimensions = Vec::with_capacity(rows.len());
        for (id, topic, index, option_type, strike) in rows {
            let option_type = match option_type.as_deref() {
                None => None,
                Some(raw) => match OptionType::from_str(raw) {
                    Some(t) => Some(t),
                    None => {
                        warn!("Skipping dimension {} with unknown option type '{}'", id, raw);
                        continue;
                    }
                },
            };
            dimensions.push((DimensionKey::new(topic, index, option_type, strike), id));
        }

        Ok(dimensions)
    }

    async fn find_dimension(&self, key: &DimensionKey) -> RepositoryResult<Option<i64>> {
        let result: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT topic_id FROM topics
            WHERE topic_name = $1
              AND index_name IS NOT DISTINCT FROM $2
              AND option_type IS NOT DISTINCT FROM $3
              AND strike IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(&key.topic)
        .bind(&key.index)
        .bind(key.option_type.map(|t| t.as_str()))
        .bind(key.strike)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.map(|(id,)| id))
    }

    async fn upsert_dimension(&self, key: &DimensionKey) -> RepositoryResult<i64> {
        // Relies on the null-aware unique index created by the migrations
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO topics (topic_name, index_name, option_type, strike)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            RETURNING topic_id
            "#,
        )
        .bind(&key.topic)
        .bind(&key.index)
        .bind(key.option_type.map(|t| t.as_str()))
        .bind(key.strike)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            debug!("Created dimension {} for {}", id, key);
            return Ok(id);
        }

        // Lost the race to another writer; its row is visible now
        self.find_dimension(key)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("dimension {}", key)))
    }
}

#[async_trait]
impl ReadingSink for LtpRepository {
    async fn insert_readings(&self, rows: &[ReadingRow]) -> RepositoryResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            inserted += Self::insert_chunk(&mut tx, chunk).await?;
        }

        // Dropping `tx` on an early return rolls back
        tx.commit().await?;

        debug!("Inserted {} readings", inserted);
        Ok(inserted)
    }
}

/// Overall database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub total_dimensions: u64,
    pub total_readings: u64,
    pub earliest_time: Option<DateTime<Utc>>,
    pub latest_time: Option<DateTime<Utc>>,
}

/// Most recent stored value of one dimension
#[derive(Debug, Clone)]
pub struct LatestReading {
    pub topic: String,
    pub option_type: Option<OptionType>,
    pub strike: Option<Decimal>,
    pub value: Decimal,
    pub observed_at: DateTime<Utc>,
}
