use crate::results::{PersistenceError, ResultRecord, ResultStore};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::time::Duration;

/// A [`ResultStore`] backed by a Postgres table.
///
/// Inserts are idempotent: a redelivered message does not overwrite nor duplicate the record
/// that was persisted on its first delivery.
#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a store on top of a lazily-initialised connection pool: no connection is attempted
    /// until the first query.
    pub fn connect_lazy(options: PgConnectOptions, max_connections: u32) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy_with(options);
        Self::new(pool)
    }

    /// Create the `count_results` table if it does not exist yet.
    #[tracing::instrument(name = "ensure_results_schema", skip_all)]
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS count_results (
                id TEXT PRIMARY KEY,
                count BIGINT NOT NULL,
                producer TEXT,
                message TEXT,
                persisted_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ResultStore for PostgresResultStore {
    #[tracing::instrument(name = "save_count_result", skip_all, fields(record_id = %record.id))]
    async fn save(&self, record: &ResultRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO count_results (id, count, producer, message)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.count)
        .bind(&record.producer)
        .bind(&record.message)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::new(record, e))?;
        Ok(())
    }
}
