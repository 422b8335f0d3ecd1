//! Schema migrations
//!
//! Creates the dimension table (`topics`), the reading table (`ltp_data`) and
//! the null-aware uniqueness constraint that backs the dimension upsert.

use sqlx::PgPool;
use tracing::{debug, info};

use super::{RepositoryError, RepositoryResult};

/// Schema migration helper
pub struct Migrations {
    pool: PgPool,
    value_precision: u32,
}

impl Migrations {
    /// `value_precision` is the total digit count of `ltp_data.ltp` (scale 2)
    pub fn new(pool: PgPool, value_precision: u32) -> Self {
        Self {
            pool,
            value_precision,
        }
    }

    /// Run database migrations
    pub async fn run(&self) -> RepositoryResult<()> {
        info!("Running migrations...");

        let statements = migration_statements(self.value_precision)?;
        for statement in &statements {
            debug!("{}", statement.trim());
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Migrations completed ({} statements)", statements.len());
        Ok(())
    }
}

/// DDL statements in execution order
pub fn migration_statements(value_precision: u32) -> RepositoryResult<Vec<String>> {
    if !(3..=28).contains(&value_precision) {
        return Err(RepositoryError::Configuration(format!(
            "value precision {} outside 3..=28",
            value_precision
        )));
    }

    Ok(vec![
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            topic_id BIGSERIAL PRIMARY KEY,
            topic_name TEXT NOT NULL,
            index_name TEXT,
            option_type TEXT CHECK (option_type IN ('ce', 'pe')),
            strike NUMERIC,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
        .to_string(),
        // NULL never equals NULL in a plain unique index, so map absent fields
        // to sentinels that cannot occur in real data. topic_name is part of
        // the key so unattributed topics do not collapse into one all-NULL row.
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_topics_dimension
        ON topics (
            topic_name,
            COALESCE(index_name, ''),
            COALESCE(option_type, ''),
            COALESCE(strike, -1)
        )
        "#
        .to_string(),
        r#"
        CREATE INDEX IF NOT EXISTS idx_topics_index_name
        ON topics (index_name)
        "#
        .to_string(),
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS ltp_data (
            id BIGSERIAL PRIMARY KEY,
            topic_id BIGINT NOT NULL REFERENCES topics (topic_id),
            ltp NUMERIC({}, 2) NOT NULL,
            observed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
            value_precision
        ),
        r#"
        CREATE INDEX IF NOT EXISTS idx_ltp_data_topic_ts
        ON ltp_data (topic_id, observed_at DESC)
        "#
        .to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_precision() {
        let statements = migration_statements(12).unwrap();
        assert_eq!(statements.len(), 5);
        assert!(statements.iter().any(|s| s.contains("NUMERIC(12, 2)")));
    }

    #[test]
    fn test_unique_index_is_null_aware() {
        let statements = migration_statements(10).unwrap();
        let unique = statements
            .iter()
            .find(|s| s.contains("CREATE UNIQUE INDEX"))
            .unwrap();
        assert!(unique.contains("COALESCE(index_name, '')"));
        assert!(unique.contains("COALESCE(strike, -1)"));
        assert!(unique.contains("topic_name,"));
    }

    #[test]
    fn test_precision_bounds() {
        assert!(migration_statements(2).is_err());
        assert!(migration_statements(29).is_err());
    }
}
