// alya-pg - Postgres implementation of the persistence contract
//
// All multi-row operations are bulk; claiming uses
// SELECT ... FOR UPDATE SKIP LOCKED so concurrent workers never contend on
// the same rows; per-batch serialization during summarization uses
// transaction-scoped advisory locks keyed by a 64-bit hash of the batch id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use alya_core::store::{Persistence, PersistenceTx};
use alya_core::types::{Batch, BatchRow};

mod row_map;
mod schema;
mod tx;

pub use schema::SCHEMA_SQL;
pub use tx::advisory_lock_key;

use tx::PgTx;

/// Pooled Postgres store. Cloning is cheap; the pool is shared.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to database at {}", url))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the reference schema. Intended for tests and local bootstrap;
    /// production schema evolution is owned by an external migration tool.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("Failed to apply alya schema")?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn begin(&self) -> Result<Box<dyn PersistenceTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(Box::new(PgTx::new(tx)))
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query(
            "SELECT id, app, op, context, inputfile, status, reqat, doneat, outputfiles, \
             nsuccess, nfailed, naborted FROM batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load batch {}", id))?;
        row.as_ref().map(row_map::batch_from_row).transpose()
    }

    async fn get_batch_rows_sorted(&self, id: &str) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query(
            "SELECT rowid, batch, line, input, status, reqat, doneat, res, blobrows, \
             messages, doneby FROM batchrows WHERE batch = $1 ORDER BY line",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load rows of batch {}", id))?;
        rows.iter().map(row_map::batch_row_from_row).collect()
    }

    async fn get_unsummarized_batches(&self) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT b.id FROM batches b \
             WHERE b.status = 'inprog' AND b.doneat IS NULL \
               AND NOT EXISTS (SELECT 1 FROM batchrows r \
                               WHERE r.batch = b.id AND r.status IN ('queued', 'inprog'))",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to scan for unsummarized batches")?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
