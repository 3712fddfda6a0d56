//! Adapter seams consumed by the coordination core.
//!
//! The Postgres, Redis, and object-store crates implement these; the test
//! harness provides in-memory implementations. Methods return
//! `anyhow::Result` with typed sentinel errors threaded through where the
//! caller needs to branch on them.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{
    Batch, BatchRow, BatchStatus, BatchSummary, BlobRows, ClaimedRow, ErrorMessage, OutputFiles,
    RowStatus,
};

/// A row to insert at submit/append time.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub line: i32,
    pub input: Value,
}

/// Terminal write for one row.
#[derive(Debug, Clone)]
pub struct RowResult {
    pub rowid: i64,
    pub status: RowStatus,
    pub doneat: DateTime<Utc>,
    pub res: Value,
    pub blobrows: Option<BlobRows>,
    pub messages: Vec<ErrorMessage>,
    pub doneby: String,
}

/// Terminal write for one batch.
#[derive(Debug, Clone)]
pub struct BatchSummaryUpdate {
    pub id: String,
    pub status: BatchStatus,
    pub doneat: DateTime<Utc>,
    pub outputfiles: OutputFiles,
    pub nsuccess: i32,
    pub nfailed: i32,
    pub naborted: i32,
}

/// Authoritative store for batches and rows.
///
/// Any transient error aborts the caller's current cycle; the supervisor
/// retries after backoff.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn PersistenceTx>>;

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>>;

    /// All rows of a batch in ascending `line` order.
    async fn get_batch_rows_sorted(&self, id: &str) -> Result<Vec<BatchRow>>;

    /// Batches in `inprog` whose rows are all terminal and whose `doneat`
    /// is still unset; the sweep feeds these back through summarization.
    async fn get_unsummarized_batches(&self) -> Result<Vec<String>>;
}

/// One database transaction. Dropping a transaction without committing
/// rolls it back.
#[async_trait]
pub trait PersistenceTx: Send {
    async fn insert_batch(&mut self, batch: &Batch) -> Result<()>;

    async fn bulk_insert_rows(
        &mut self,
        batch: &str,
        rows: &[NewRow],
        reqat: DateTime<Utc>,
    ) -> Result<()>;

    /// Claim up to `limit` rows in the given status, skipping rows locked
    /// by other workers and rows belonging to `wait` batches. Claimed rows
    /// stay locked until the transaction ends.
    async fn fetch_block_of_rows(
        &mut self,
        status: RowStatus,
        limit: i64,
    ) -> Result<Vec<ClaimedRow>>;

    /// Conditional on current status `queued`; already-`inprog` batches are
    /// left untouched, which makes the promotion idempotent.
    async fn update_batches_status_bulk(
        &mut self,
        ids: &[String],
        to: BatchStatus,
    ) -> Result<()>;

    async fn update_rows_status_bulk(&mut self, rowids: &[i64], to: RowStatus) -> Result<()>;

    async fn update_row_result(&mut self, result: &RowResult) -> Result<()>;

    /// Guarded by `status = 'inprog'` so concurrent recoveries (and
    /// recoveries racing a finished row) are no-ops. Returns rows touched.
    async fn reset_rows_to_queued(&mut self, rowids: &[i64]) -> Result<u64>;

    async fn count_rows_queued(&mut self, batch: &str) -> Result<i64>;

    async fn count_rows_inprog(&mut self, batch: &str) -> Result<i64>;

    async fn get_batch(&mut self, id: &str) -> Result<Option<Batch>>;

    async fn get_batch_for_update(&mut self, id: &str) -> Result<Option<Batch>>;

    /// Rows still in `queued` or `inprog`.
    async fn get_pending_rows(&mut self, batch: &str) -> Result<Vec<BatchRow>>;

    /// Terminal rows in ascending `line` order.
    async fn get_processed_rows_sorted(&mut self, batch: &str) -> Result<Vec<BatchRow>>;

    async fn get_rows_sorted(&mut self, batch: &str) -> Result<Vec<BatchRow>>;

    /// Non-blocking, transaction-scoped advisory lock on the batch;
    /// released when the transaction commits or rolls back.
    async fn try_advisory_lock_batch(&mut self, batch: &str) -> Result<bool>;

    async fn update_batch_summary(&mut self, update: &BatchSummaryUpdate) -> Result<()>;

    async fn update_batch_status(&mut self, id: &str, to: BatchStatus) -> Result<()>;

    /// Bulk-fail every still-pending row of a batch with the same result
    /// payload; used for configuration-error widening. Returns rows touched.
    async fn fail_pending_rows(
        &mut self,
        batch: &str,
        doneat: DateTime<Utc>,
        res: &Value,
        messages: &[ErrorMessage],
        doneby: &str,
    ) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Coordination cache and worker liveness state.
///
/// Keystore failures are never fatal to job execution (the database is
/// authoritative); callers log and continue. The one exception is recovery,
/// which cannot proceed without it.
#[async_trait]
pub trait Keystore: Send + Sync + 'static {
    async fn get_batch_status(&self, batch: &str) -> Result<Option<BatchStatus>>;

    async fn set_batch_status(
        &self,
        batch: &str,
        status: BatchStatus,
        ttl: Duration,
    ) -> Result<()>;

    /// Atomically write the per-batch cache keys (status plus whichever of
    /// result / output-files / summary are present) in a single pipeline
    /// transaction. The keys share a co-location marker, so a sharded
    /// keystore can apply them on one partition.
    async fn set_batch_caches(
        &self,
        batch: &str,
        status: BatchStatus,
        result: Option<&Value>,
        output_files: Option<&OutputFiles>,
        summary: Option<&BatchSummary>,
        ttl: Duration,
    ) -> Result<()>;

    async fn get_batch_summary(&self, batch: &str) -> Result<Option<BatchSummary>>;

    async fn get_batch_result(&self, batch: &str) -> Result<Option<Value>>;

    async fn register_worker(&self, instance: &str) -> Result<()>;

    async fn deregister_worker(&self, instance: &str) -> Result<()>;

    async fn worker_members(&self) -> Result<Vec<String>>;

    async fn set_heartbeat(&self, instance: &str, ttl: Duration) -> Result<()>;

    async fn delete_heartbeat(&self, instance: &str) -> Result<()>;

    async fn heartbeat_exists(&self, instance: &str) -> Result<bool>;

    /// Add claimed rows to the worker's active set and bump its TTL.
    async fn track_rows(&self, instance: &str, rowids: &[i64], ttl: Duration) -> Result<()>;

    async fn untrack_row(&self, instance: &str, rowid: i64) -> Result<()>;

    async fn tracked_rows(&self, instance: &str) -> Result<Vec<i64>>;

    async fn delete_tracked_rows(&self, instance: &str) -> Result<()>;

    async fn refresh_tracked_ttl(&self, instance: &str, ttl: Duration) -> Result<()>;
}

/// Minimal object-store capability used by the summarizer.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(
        &self,
        bucket: &str,
        object: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
}
