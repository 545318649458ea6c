use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};

use super::{Storage, StorageError};
use crate::metric::{MetricKind, MetricValue};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    name  TEXT UNIQUE NOT NULL,
    type  TEXT NOT NULL,
    delta BIGINT,
    value DOUBLE PRECISION
)
"#;

const UPSERT: &str = r#"
INSERT INTO metrics (name, type, delta, value)
VALUES ($1, $2, $3, $4)
ON CONFLICT (name) DO UPDATE
SET type = EXCLUDED.type, delta = EXCLUDED.delta, value = EXCLUDED.value
"#;

/// Counters add onto a stored counter in the same statement, so concurrent
/// deltas serialize on the row lock.
const ACCUMULATE: &str = r#"
INSERT INTO metrics (name, type, delta, value)
VALUES ($1, $2, $3, $4)
ON CONFLICT (name) DO UPDATE
SET type = EXCLUDED.type,
    delta = CASE
        WHEN EXCLUDED.type = 'counter' AND metrics.type = 'counter'
            THEN COALESCE(metrics.delta, 0) + EXCLUDED.delta
        ELSE EXCLUDED.delta
    END,
    value = EXCLUDED.value
RETURNING type, delta, value
"#;

/// PostgreSQL backend. Durability is the database's job; there is no
/// snapshot capability.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect and create the `metrics` table if it does not exist.
    pub async fn connect(dsn: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        info!("connected to postgres, metrics table ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Upsert binding the column that matches the value's kind and clearing the
/// other one.
fn upsert(key: &str, value: MetricValue) -> Query<'_, Postgres, PgArguments> {
    bind(UPSERT, key, value)
}

fn accumulate_query(key: &str, value: MetricValue) -> Query<'_, Postgres, PgArguments> {
    bind(ACCUMULATE, key, value)
}

fn bind<'q>(sql: &'static str, key: &'q str, value: MetricValue) -> Query<'q, Postgres, PgArguments> {
    let (delta, gauge) = match value {
        MetricValue::Gauge(v) => (None, Some(v)),
        MetricValue::Counter(d) => (Some(d), None),
    };
    sqlx::query(sql)
        .bind(key)
        .bind(value.kind().as_str())
        .bind(delta)
        .bind(gauge)
}

fn decode_row(row: &PgRow) -> Result<MetricValue, StorageError> {
    let kind: String = row.try_get("type")?;
    let delta: Option<i64> = row.try_get("delta")?;
    let value: Option<f64> = row.try_get("value")?;

    Ok(match (delta, value) {
        (Some(d), _) => MetricValue::Counter(d),
        (None, Some(v)) => MetricValue::Gauge(v),
        // both columns null: zero of the recorded kind
        (None, None) => match kind.parse::<MetricKind>() {
            Ok(MetricKind::Counter) => MetricValue::Counter(0),
            _ => MetricValue::Gauge(0.0),
        },
    })
}

#[async_trait]
impl Storage for PgStorage {
    async fn set(&self, key: &str, value: MetricValue) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        upsert(key, value).execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<MetricValue, StorageError> {
        let row = sqlx::query("SELECT type, delta, value FROM metrics WHERE name = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        decode_row(&row)
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = sqlx::query_scalar("SELECT name FROM metrics")
            .fetch_all(&self.pool)
            .await?;
        // Sorted here so the order does not depend on the database collation.
        names.sort();
        Ok(names)
    }

    async fn mset(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError> {
        if values.keys().any(|k| k.is_empty()) {
            return Err(StorageError::InvalidKey(String::new()));
        }
        let mut tx = self.pool.begin().await?;
        for (key, value) in &values {
            // dropping `tx` on error rolls back
            upsert(key, *value).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("committed batch of {} metrics", values.len());
        Ok(())
    }

    async fn accumulate(&self, key: &str, value: MetricValue) -> Result<MetricValue, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let row = accumulate_query(key, value).fetch_one(&self.pool).await?;
        decode_row(&row)
    }

    async fn accumulate_all(&self, values: HashMap<String, MetricValue>) -> Result<(), StorageError> {
        if values.keys().any(|k| k.is_empty()) {
            return Err(StorageError::InvalidKey(String::new()));
        }
        let mut tx = self.pool.begin().await?;
        for (key, value) in &values {
            accumulate_query(key, *value).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("accumulated batch of {} metrics", values.len());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}
