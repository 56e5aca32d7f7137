//! Relational backend
//!
//! Gauges and counters live in two tables keyed by metric name. Merge
//! semantics are expressed as upserts so a point update is a single
//! statement, bulk reload runs in one transaction so concurrent readers see
//! either the old population or the new one.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tally_metric::{Kind, Metric};

use super::{Error, Repository};

const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
/// Backend persisting every update to a relational database.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database at `dsn` and create the schema if it does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Function will error if the database is unreachable or schema
    /// creation fails.
    pub async fn connect(dsn: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(dsn)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS gauges (
                 name TEXT PRIMARY KEY,
                 value DOUBLE PRECISION NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS counters (
                 name TEXT PRIMARY KEY,
                 value BIGINT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for PostgresStore {
    async fn update_gauge(&self, name: &str, value: f64) -> Result<f64, Error> {
        let row = sqlx::query(
            "INSERT INTO gauges (name, value) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
             RETURNING value",
        )
        .bind(name)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("value"))
    }

    async fn update_counter(&self, name: &str, delta: i64) -> Result<i64, Error> {
        let row = sqlx::query(
            "INSERT INTO counters (name, value) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET value = counters.value + EXCLUDED.value
             RETURNING value",
        )
        .bind(name)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("value"))
    }

    async fn gauge(&self, name: &str) -> Result<Option<f64>, Error> {
        let row = sqlx::query("SELECT value FROM gauges WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn counter(&self, name: &str) -> Result<Option<i64>, Error> {
        let row = sqlx::query("SELECT value FROM counters WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn all_gauges(&self) -> Result<FxHashMap<String, f64>, Error> {
        let rows = sqlx::query("SELECT name, value FROM gauges")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("name"), row.get("value")))
            .collect())
    }

    async fn all_counters(&self) -> Result<FxHashMap<String, i64>, Error> {
        let rows = sqlx::query("SELECT name, value FROM counters")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("name"), row.get("value")))
            .collect())
    }

    async fn gauge_count(&self) -> Result<usize, Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM gauges")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("n");
        Ok(count as usize)
    }

    async fn counter_count(&self) -> Result<usize, Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM counters")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("n");
        Ok(count as usize)
    }

    async fn replace_gauges(&self, gauges: FxHashMap<String, f64>) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE gauges").execute(&mut *tx).await?;
        for (name, value) in &gauges {
            sqlx::query("INSERT INTO gauges (name, value) VALUES ($1, $2)")
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_counters(&self, counters: FxHashMap<String, i64>) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE counters").execute(&mut *tx).await?;
        for (name, value) in &counters {
            sqlx::query("INSERT INTO counters (name, value) VALUES ($1, $2)")
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_all(&self, metrics: &[Metric]) -> Result<u64, Error> {
        // Validate the whole candidate set up front so a bad entry rejects
        // the batch before the transaction opens.
        for metric in metrics {
            match metric.kind {
                Kind::Gauge => {
                    metric.gauge_value()?;
                }
                Kind::Counter => {
                    metric.counter_delta()?;
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("TRUNCATE gauges, counters")
            .execute(&mut *tx)
            .await?;
        let mut affected = 0;
        for metric in metrics {
            let result = match metric.kind {
                Kind::Gauge => {
                    sqlx::query(
                        "INSERT INTO gauges (name, value) VALUES ($1, $2)
                         ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
                    )
                    .bind(&metric.id)
                    .bind(metric.gauge_value()?)
                    .execute(&mut *tx)
                    .await?
                }
                Kind::Counter => {
                    sqlx::query(
                        "INSERT INTO counters (name, value) VALUES ($1, $2)
                         ON CONFLICT (name) DO UPDATE SET value = counters.value + EXCLUDED.value",
                    )
                    .bind(&metric.id)
                    .bind(metric.counter_delta()?)
                    .execute(&mut *tx)
                    .await?
                }
            };
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsn() -> String {
        std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database")
    }

    #[tokio::test]
    #[ignore = "requires a live postgres, set DATABASE_URL"]
    async fn point_updates_merge_by_kind() {
        let store = PostgresStore::connect(&dsn()).await.expect("connect");
        store.replace_all(&[]).await.expect("reset");

        assert_eq!(store.update_counter("hits", 2).await.expect("update"), 2);
        assert_eq!(store.update_counter("hits", 3).await.expect("update"), 5);
        store.update_gauge("Alloc", 1.0).await.expect("update");
        store.update_gauge("Alloc", 2.5).await.expect("update");

        assert_eq!(store.counter("hits").await.expect("read"), Some(5));
        assert_eq!(store.gauge("Alloc").await.expect("read"), Some(2.5));
        assert_eq!(store.counter("absent").await.expect("read"), None);
    }

    #[tokio::test]
    #[ignore = "requires a live postgres, set DATABASE_URL"]
    async fn replace_all_supersedes_prior_population() {
        let store = PostgresStore::connect(&dsn()).await.expect("connect");
        store.replace_all(&[]).await.expect("reset");

        store.update_gauge("doomed", 9.9).await.expect("update");
        let batch = vec![Metric::gauge("Alloc", 1.25), Metric::counter("PollCount", 7)];
        let affected = store.replace_all(&batch).await.expect("replace");
        assert_eq!(affected, 2);

        assert_eq!(store.gauge("doomed").await.expect("read"), None);
        assert_eq!(store.gauge("Alloc").await.expect("read"), Some(1.25));
        assert_eq!(store.counter("PollCount").await.expect("read"), Some(7));
        assert_eq!(store.gauge_count().await.expect("count"), 1);
        assert_eq!(store.counter_count().await.expect("count"), 1);
    }
}
