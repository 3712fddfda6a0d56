//! Transactional queries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, Transaction};

use alya_core::store::{BatchSummaryUpdate, NewRow, PersistenceTx, RowResult};
use alya_core::types::{Batch, BatchRow, BatchStatus, ClaimedRow, ErrorMessage, RowStatus};

use crate::row_map;

/// Advisory lock key for one batch: a stable 64-bit FNV-1a hash of the
/// batch id, reinterpreted as the signed key pg_try_advisory_xact_lock
/// expects.
pub fn advisory_lock_key(batch_id: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in batch_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

pub(crate) struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    pub(crate) fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

fn messages_json(messages: &[ErrorMessage]) -> Result<Option<Value>> {
    if messages.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_value(messages)?))
}

#[async_trait]
impl PersistenceTx for PgTx {
    async fn insert_batch(&mut self, batch: &Batch) -> Result<()> {
        sqlx::query(
            "INSERT INTO batches (id, app, op, context, inputfile, status, reqat) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&batch.id)
        .bind(&batch.app)
        .bind(&batch.op)
        .bind(&batch.context)
        .bind(&batch.inputfile)
        .bind(batch.status.as_str())
        .bind(batch.reqat)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("Failed to insert batch {}", batch.id))?;
        Ok(())
    }

    async fn bulk_insert_rows(
        &mut self,
        batch: &str,
        rows: &[NewRow],
        reqat: DateTime<Utc>,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO batchrows (batch, line, input, status, reqat) ");
        builder.push_values(rows, |mut b, row| {
            b.push_bind(batch)
                .push_bind(row.line)
                .push_bind(&row.input)
                .push_bind(RowStatus::Queued.as_str())
                .push_bind(reqat);
        });
        builder
            .build()
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to bulk-insert {} rows for batch {}", rows.len(), batch))?;
        Ok(())
    }

    async fn fetch_block_of_rows(
        &mut self,
        status: RowStatus,
        limit: i64,
    ) -> Result<Vec<ClaimedRow>> {
        // SKIP LOCKED keeps concurrent claimers from blocking on each
        // other's uncommitted claims; wait batches are held back entirely.
        let rows = sqlx::query(
            "SELECT r.rowid, r.batch, r.line, r.input, r.status, b.app, b.op, b.context \
             FROM batchrows r \
             JOIN batches b ON b.id = r.batch \
             WHERE r.status = $1 AND b.status <> 'wait' \
             ORDER BY r.rowid \
             LIMIT $2 \
             FOR UPDATE OF r SKIP LOCKED",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await
        .context("Failed to claim a block of rows")?;
        rows.iter().map(row_map::claimed_row_from_row).collect()
    }

    async fn update_batches_status_bulk(
        &mut self,
        ids: &[String],
        to: BatchStatus,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE batches SET status = $2 WHERE id = ANY($1) AND status = 'queued'")
            .bind(ids.to_vec())
            .bind(to.as_str())
            .execute(&mut *self.tx)
            .await
            .context("Failed to bulk-update batch statuses")?;
        Ok(())
    }

    async fn update_rows_status_bulk(&mut self, rowids: &[i64], to: RowStatus) -> Result<()> {
        if rowids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE batchrows SET status = $2 WHERE rowid = ANY($1)")
            .bind(rowids.to_vec())
            .bind(to.as_str())
            .execute(&mut *self.tx)
            .await
            .context("Failed to bulk-update row statuses")?;
        Ok(())
    }

    async fn update_row_result(&mut self, result: &RowResult) -> Result<()> {
        let blobrows = result
            .blobrows
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        sqlx::query(
            "UPDATE batchrows SET status = $2, doneat = $3, res = $4, blobrows = $5, \
             messages = $6, doneby = $7 WHERE rowid = $1",
        )
        .bind(result.rowid)
        .bind(result.status.as_str())
        .bind(result.doneat)
        .bind(&result.res)
        .bind(blobrows)
        .bind(messages_json(&result.messages)?)
        .bind(&result.doneby)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("Failed to write result for row {}", result.rowid))?;
        Ok(())
    }

    async fn reset_rows_to_queued(&mut self, rowids: &[i64]) -> Result<u64> {
        if rowids.is_empty() {
            return Ok(0);
        }
        // The inprog guard makes double-execution of recovery a no-op and
        // protects rows a slow worker finished after being declared dead.
        let done = sqlx::query(
            "UPDATE batchrows SET status = 'queued', doneby = NULL \
             WHERE rowid = ANY($1) AND status = 'inprog'",
        )
        .bind(rowids.to_vec())
        .execute(&mut *self.tx)
        .await
        .context("Failed to reset abandoned rows")?;
        Ok(done.rows_affected())
    }

    async fn count_rows_queued(&mut self, batch: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM batchrows WHERE batch = $1 AND status = 'queued'")
                .bind(batch)
                .fetch_one(&mut *self.tx)
                .await
                .context("Failed to count queued rows")?;
        Ok(count)
    }

    async fn count_rows_inprog(&mut self, batch: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM batchrows WHERE batch = $1 AND status = 'inprog'")
                .bind(batch)
                .fetch_one(&mut *self.tx)
                .await
                .context("Failed to count in-progress rows")?;
        Ok(count)
    }

    async fn get_batch(&mut self, id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query(
            "SELECT id, app, op, context, inputfile, status, reqat, doneat, outputfiles, \
             nsuccess, nfailed, naborted FROM batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .with_context(|| format!("Failed to load batch {}", id))?;
        row.as_ref().map(row_map::batch_from_row).transpose()
    }

    async fn get_batch_for_update(&mut self, id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query(
            "SELECT id, app, op, context, inputfile, status, reqat, doneat, outputfiles, \
             nsuccess, nfailed, naborted FROM batches WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .with_context(|| format!("Failed to lock batch {}", id))?;
        row.as_ref().map(row_map::batch_from_row).transpose()
    }

    async fn get_pending_rows(&mut self, batch: &str) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query(
            "SELECT rowid, batch, line, input, status, reqat, doneat, res, blobrows, \
             messages, doneby FROM batchrows \
             WHERE batch = $1 AND status IN ('queued', 'inprog') ORDER BY line",
        )
        .bind(batch)
        .fetch_all(&mut *self.tx)
        .await
        .context("Failed to load pending rows")?;
        rows.iter().map(row_map::batch_row_from_row).collect()
    }

    async fn get_processed_rows_sorted(&mut self, batch: &str) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query(
            "SELECT rowid, batch, line, input, status, reqat, doneat, res, blobrows, \
             messages, doneby FROM batchrows \
             WHERE batch = $1 AND status IN ('success', 'failed', 'aborted') ORDER BY line",
        )
        .bind(batch)
        .fetch_all(&mut *self.tx)
        .await
        .context("Failed to load processed rows")?;
        rows.iter().map(row_map::batch_row_from_row).collect()
    }

    async fn get_rows_sorted(&mut self, batch: &str) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query(
            "SELECT rowid, batch, line, input, status, reqat, doneat, res, blobrows, \
             messages, doneby FROM batchrows WHERE batch = $1 ORDER BY line",
        )
        .bind(batch)
        .fetch_all(&mut *self.tx)
        .await
        .context("Failed to load batch rows")?;
        rows.iter().map(row_map::batch_row_from_row).collect()
    }

    async fn try_advisory_lock_batch(&mut self, batch: &str) -> Result<bool> {
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(advisory_lock_key(batch))
            .fetch_one(&mut *self.tx)
            .await
            .context("Failed to take batch advisory lock")?;
        Ok(locked)
    }

    async fn update_batch_summary(&mut self, update: &BatchSummaryUpdate) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET status = $2, doneat = $3, outputfiles = $4, \
             nsuccess = $5, nfailed = $6, naborted = $7 WHERE id = $1",
        )
        .bind(&update.id)
        .bind(update.status.as_str())
        .bind(update.doneat)
        .bind(serde_json::to_value(&update.outputfiles)?)
        .bind(update.nsuccess)
        .bind(update.nfailed)
        .bind(update.naborted)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("Failed to finalize batch {}", update.id))?;
        Ok(())
    }

    async fn update_batch_status(&mut self, id: &str, to: BatchStatus) -> Result<()> {
        sqlx::query("UPDATE batches SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(to.as_str())
            .execute(&mut *self.tx)
            .await
            .with_context(|| format!("Failed to update status of batch {}", id))?;
        Ok(())
    }

    async fn fail_pending_rows(
        &mut self,
        batch: &str,
        doneat: DateTime<Utc>,
        res: &Value,
        messages: &[ErrorMessage],
        doneby: &str,
    ) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE batchrows SET status = 'failed', doneat = $2, res = $3, messages = $4, \
             doneby = $5 WHERE batch = $1 AND status IN ('queued', 'inprog')",
        )
        .bind(batch)
        .bind(doneat)
        .bind(res)
        .bind(messages_json(messages)?)
        .bind(doneby)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("Failed to widen failure across batch {}", batch))?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("Failed to roll back")?;
        Ok(())
    }
}
