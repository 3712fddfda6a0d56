//! Client-side helpers: submit, append, poll, and abort.
//!
//! These run in the submitting process, not in workers. Polling consults
//! the status cache first and falls back to the database, refreshing the
//! cache on the way out; terminal entries get the long TTL.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use alya_config::JobsConfig;
use alya_core::error::StateError;
use alya_core::store::{BatchSummaryUpdate, Keystore, NewRow, Persistence};
use alya_core::types::{
    Batch, BatchStatus, BatchSummary, DoneStatus, ErrorMessage, OutputFiles, RowStatus,
};

/// Poll result for an ordinary batch.
#[derive(Debug, Clone)]
pub struct BatchDoneResult {
    pub status: DoneStatus,
    pub output_files: OutputFiles,
    pub n_success: i32,
    pub n_failed: i32,
    pub n_aborted: i32,
}

impl BatchDoneResult {
    fn try_later() -> Self {
        Self {
            status: DoneStatus::TryLater,
            output_files: OutputFiles::new(),
            n_success: 0,
            n_failed: 0,
            n_aborted: 0,
        }
    }
}

/// Poll result for a slow query.
#[derive(Debug, Clone)]
pub struct SlowQueryDoneResult {
    pub status: DoneStatus,
    pub res: Value,
    pub messages: Vec<ErrorMessage>,
    pub output_files: OutputFiles,
}

impl SlowQueryDoneResult {
    fn try_later() -> Self {
        Self {
            status: DoneStatus::TryLater,
            res: Value::Null,
            messages: Vec::new(),
            output_files: OutputFiles::new(),
        }
    }
}

/// Outcome of an abort: the batch's terminal status and counts, whether
/// this call aborted it or it was already terminal.
#[derive(Debug, Clone)]
pub struct AbortResult {
    pub status: BatchStatus,
    pub n_success: i32,
    pub n_failed: i32,
    pub n_aborted: i32,
}

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Persistence>,
    keystore: Arc<dyn Keystore>,
    cfg: JobsConfig,
}

impl Client {
    pub fn new(store: Arc<dyn Persistence>, keystore: Arc<dyn Keystore>, cfg: JobsConfig) -> Self {
        Self {
            store,
            keystore,
            cfg,
        }
    }

    /// Submit a batch of inputs; rows are numbered from 1 in input order.
    /// With `waitabit` the batch is created in `wait` and held until
    /// [`Client::wait_off`] releases it.
    pub async fn batch_submit(
        &self,
        app: &str,
        op: &str,
        context: Value,
        inputs: Vec<Value>,
        waitabit: bool,
    ) -> Result<String> {
        let rows: Vec<NewRow> = inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| NewRow {
                line: i as i32 + 1,
                input,
            })
            .collect();
        self.submit(app, op, context, rows, waitabit).await
    }

    /// Submit a slow query: a batch holding exactly one `line = 0` row.
    pub async fn slow_query_submit(
        &self,
        app: &str,
        op: &str,
        context: Value,
        input: Value,
    ) -> Result<String> {
        self.submit(app, op, context, vec![NewRow { line: 0, input }], false)
            .await
    }

    async fn submit(
        &self,
        app: &str,
        op: &str,
        context: Value,
        rows: Vec<NewRow>,
        waitabit: bool,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let batch = Batch {
            id: id.clone(),
            app: app.to_string(),
            op: op.to_lowercase(),
            context,
            inputfile: None,
            status: if waitabit {
                BatchStatus::Wait
            } else {
                BatchStatus::Queued
            },
            reqat: now,
            doneat: None,
            outputfiles: None,
            nsuccess: None,
            nfailed: None,
            naborted: None,
        };

        let mut tx = self.store.begin().await?;
        tx.insert_batch(&batch).await?;
        tx.bulk_insert_rows(&id, &rows, now).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Release a `wait` batch to the queue. Idempotent for batches already
    /// `queued`; any other status is an error.
    pub async fn wait_off(&self, batch_id: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let Some(batch) = tx.get_batch_for_update(batch_id).await? else {
            tx.rollback().await?;
            return Err(StateError::BatchNotFound(batch_id.to_string()).into());
        };
        match batch.status {
            BatchStatus::Wait => {
                tx.update_batch_status(batch_id, BatchStatus::Queued).await?;
                tx.commit().await?;
                Ok(())
            }
            BatchStatus::Queued => {
                tx.rollback().await?;
                Ok(())
            }
            status => {
                tx.rollback().await?;
                Err(StateError::NotWaiting {
                    id: batch_id.to_string(),
                    status,
                }
                .into())
            }
        }
    }

    /// Append rows to a batch still in `wait`; optionally release it in
    /// the same transaction. Lines must be >= 1 and unique within the
    /// call.
    pub async fn batch_append(
        &self,
        batch_id: &str,
        rows: Vec<NewRow>,
        waitabit: bool,
    ) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for row in &rows {
            if row.line < 1 {
                return Err(StateError::InvalidLine(row.line).into());
            }
            if !seen.insert(row.line) {
                return Err(StateError::DuplicateLine(row.line).into());
            }
        }

        let mut tx = self.store.begin().await?;
        let Some(batch) = tx.get_batch_for_update(batch_id).await? else {
            tx.rollback().await?;
            return Err(StateError::BatchNotFound(batch_id.to_string()).into());
        };
        if batch.status != BatchStatus::Wait {
            tx.rollback().await?;
            return Err(StateError::NotWaiting {
                id: batch_id.to_string(),
                status: batch.status,
            }
            .into());
        }
        tx.bulk_insert_rows(batch_id, &rows, Utc::now()).await?;
        if !waitabit {
            tx.update_batch_status(batch_id, BatchStatus::Queued).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Poll an ordinary batch.
    pub async fn batch_done(&self, batch_id: &str) -> Result<BatchDoneResult> {
        match self.keystore.get_batch_status(batch_id).await {
            Ok(Some(status)) if !status.is_terminal() => {
                return Ok(BatchDoneResult::try_later());
            }
            Ok(Some(status)) => {
                if let Ok(Some(summary)) = self.keystore.get_batch_summary(batch_id).await {
                    return Ok(BatchDoneResult {
                        status: status.into(),
                        output_files: summary.output_files,
                        n_success: summary.n_success,
                        n_failed: summary.n_failed,
                        n_aborted: summary.n_aborted,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => debug!(batch = %batch_id, error = %e, "status cache read failed"),
        }

        let Some(batch) = self.store.get_batch(batch_id).await? else {
            return Err(StateError::BatchNotFound(batch_id.to_string()).into());
        };
        if !batch.status.is_terminal() {
            if let Err(e) = self
                .keystore
                .set_batch_status(batch_id, batch.status, self.cfg.status_cache_ttl())
                .await
            {
                debug!(batch = %batch_id, error = %e, "status cache write failed");
            }
            return Ok(BatchDoneResult::try_later());
        }

        let output_files = batch.outputfiles.clone().unwrap_or_default();
        let summary = BatchSummary {
            status: batch.status,
            output_files: output_files.clone(),
            n_success: batch.nsuccess.unwrap_or(0),
            n_failed: batch.nfailed.unwrap_or(0),
            n_aborted: batch.naborted.unwrap_or(0),
        };
        if let Err(e) = self
            .keystore
            .set_batch_caches(
                batch_id,
                batch.status,
                None,
                Some(&output_files),
                Some(&summary),
                self.cfg.terminal_cache_ttl(),
            )
            .await
        {
            debug!(batch = %batch_id, error = %e, "terminal cache write failed");
        }
        Ok(BatchDoneResult {
            status: batch.status.into(),
            output_files,
            n_success: summary.n_success,
            n_failed: summary.n_failed,
            n_aborted: summary.n_aborted,
        })
    }

    /// Poll a slow query.
    pub async fn slow_query_done(&self, req_id: &str) -> Result<SlowQueryDoneResult> {
        match self.keystore.get_batch_status(req_id).await {
            Ok(Some(status)) if !status.is_terminal() => {
                return Ok(SlowQueryDoneResult::try_later());
            }
            Ok(Some(BatchStatus::Success)) => {
                // A successful query carries no messages, so the cached
                // result and summary answer the poll completely. Failed
                // and aborted queries fall through to the database for
                // their message list.
                if let (Ok(Some(res)), Ok(Some(summary))) = (
                    self.keystore.get_batch_result(req_id).await,
                    self.keystore.get_batch_summary(req_id).await,
                ) {
                    return Ok(SlowQueryDoneResult {
                        status: DoneStatus::Success,
                        res,
                        messages: Vec::new(),
                        output_files: summary.output_files,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => debug!(batch = %req_id, error = %e, "status cache read failed"),
        }

        let Some(batch) = self.store.get_batch(req_id).await? else {
            return Err(StateError::BatchNotFound(req_id.to_string()).into());
        };
        if !batch.status.is_terminal() {
            if let Err(e) = self
                .keystore
                .set_batch_status(req_id, batch.status, self.cfg.status_cache_ttl())
                .await
            {
                debug!(batch = %req_id, error = %e, "status cache write failed");
            }
            return Ok(SlowQueryDoneResult::try_later());
        }

        // The row's existence decides "found"; empty res or messages are
        // legitimate for a failed query and must not read as not-found.
        let rows = self.store.get_batch_rows_sorted(req_id).await?;
        let Some(row) = rows.iter().find(|r| r.line == 0) else {
            return Err(StateError::BatchNotFound(req_id.to_string()).into());
        };
        let res = row.res.clone().unwrap_or(Value::Null);
        let messages = row.messages.clone().unwrap_or_default();
        let output_files = batch.outputfiles.clone().unwrap_or_default();

        let summary = BatchSummary {
            status: batch.status,
            output_files: output_files.clone(),
            n_success: batch.nsuccess.unwrap_or(0),
            n_failed: batch.nfailed.unwrap_or(0),
            n_aborted: batch.naborted.unwrap_or(0),
        };
        if let Err(e) = self
            .keystore
            .set_batch_caches(
                req_id,
                batch.status,
                Some(&res),
                Some(&output_files),
                Some(&summary),
                self.cfg.terminal_cache_ttl(),
            )
            .await
        {
            debug!(batch = %req_id, error = %e, "terminal cache write failed");
        }
        Ok(SlowQueryDoneResult {
            status: batch.status.into(),
            res,
            messages,
            output_files,
        })
    }

    /// Abort every pending row of a batch and finalize it as `aborted`.
    /// An already-terminal batch returns its current counts unchanged.
    pub async fn batch_abort(&self, batch_id: &str) -> Result<AbortResult> {
        let mut tx = self.store.begin().await?;
        let Some(batch) = tx.get_batch_for_update(batch_id).await? else {
            tx.rollback().await?;
            return Err(StateError::BatchNotFound(batch_id.to_string()).into());
        };
        if batch.status.is_terminal() {
            tx.rollback().await?;
            return Ok(AbortResult {
                status: batch.status,
                n_success: batch.nsuccess.unwrap_or(0),
                n_failed: batch.nfailed.unwrap_or(0),
                n_aborted: batch.naborted.unwrap_or(0),
            });
        }

        let pending = tx.get_pending_rows(batch_id).await?;
        if pending.is_empty() {
            tx.rollback().await?;
            // TODO(product): every row is terminal but the summarizer has
            // not finalized the batch yet; decide whether this should be a
            // no-op instead of an error.
            return Err(StateError::NothingToAbort(batch_id.to_string()).into());
        }

        let rowids: Vec<i64> = pending.iter().map(|r| r.rowid).collect();
        tx.update_rows_status_bulk(&rowids, RowStatus::Aborted).await?;

        let rows = tx.get_rows_sorted(batch_id).await?;
        let mut n_success = 0;
        let mut n_failed = 0;
        let mut n_aborted = 0;
        for row in &rows {
            match row.status {
                RowStatus::Success => n_success += 1,
                RowStatus::Failed => n_failed += 1,
                RowStatus::Aborted => n_aborted += 1,
                _ => {}
            }
        }

        let output_files = batch.outputfiles.clone().unwrap_or_default();
        tx.update_batch_summary(&BatchSummaryUpdate {
            id: batch_id.to_string(),
            status: BatchStatus::Aborted,
            doneat: Utc::now(),
            outputfiles: output_files.clone(),
            nsuccess: n_success,
            nfailed: n_failed,
            naborted: n_aborted,
        })
        .await?;
        tx.commit().await?;

        let summary = BatchSummary {
            status: BatchStatus::Aborted,
            output_files: output_files.clone(),
            n_success,
            n_failed,
            n_aborted,
        };
        if let Err(e) = self
            .keystore
            .set_batch_caches(
                batch_id,
                BatchStatus::Aborted,
                None,
                Some(&output_files),
                Some(&summary),
                self.cfg.terminal_cache_ttl(),
            )
            .await
        {
            debug!(batch = %batch_id, error = %e, "terminal cache write failed");
        }
        Ok(AbortResult {
            status: BatchStatus::Aborted,
            n_success,
            n_failed,
            n_aborted,
        })
    }

    /// Abort a slow query; identical to a batch abort over its single row.
    pub async fn slow_query_abort(&self, req_id: &str) -> Result<AbortResult> {
        self.batch_abort(req_id).await
    }
}
