//! In-memory adapter implementations for end-to-end engine tests.
//!
//! `MemPersistence` mirrors the Postgres adapter's semantics closely
//! enough for the coordination core: claimed blocks honor the `wait`
//! filter, recovery honors the inprog guard, and the per-batch advisory
//! lock is transaction-scoped (held until commit, rollback, or drop).
//! `MemKeystore` records TTLs so tests can assert cache lifetimes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use alya_config::JobsConfig;
use alya_core::processor::{BatchProcessor, InitBlock, Initializer, SlowQueryProcessor};
use alya_core::store::{
    BatchSummaryUpdate, Keystore, NewRow, Persistence, PersistenceTx, RowResult,
};
use alya_core::types::{
    Batch, BatchDetails, BatchOutput, BatchRow, BatchStatus, BatchSummary, BlobRows, ClaimedRow,
    ErrorMessage, OutputFiles, RowStatus, SlowQueryOutput,
};

/// Install a test subscriber once; `ALYA_TEST_LOG` controls the filter.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = std::env::var("ALYA_TEST_LOG").unwrap_or_else(|_| "warn".to_string());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Fast intervals so the e2e scenarios complete in seconds.
pub fn test_cfg() -> JobsConfig {
    JobsConfig {
        polling_interval_secs: 1,
        heartbeat_interval_secs: 1,
        recovery_interval_secs: 1,
        ..JobsConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemState {
    batches: HashMap<String, Batch>,
    rows: BTreeMap<i64, BatchRow>,
    next_rowid: i64,
    advisory_locks: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemPersistence {
    state: Arc<Mutex<MemState>>,
}

/// Holds a batch's advisory lock from outside any engine transaction,
/// standing in for a second database connection.
pub struct ExternalLock {
    state: Arc<Mutex<MemState>>,
    batch: String,
}

impl Drop for ExternalLock {
    fn drop(&mut self) {
        self.state.lock().advisory_locks.remove(&self.batch);
    }
}

impl MemPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch(&self, id: &str) -> Option<Batch> {
        self.state.lock().batches.get(id).cloned()
    }

    pub fn rows_of(&self, batch: &str) -> Vec<BatchRow> {
        let state = self.state.lock();
        let mut rows: Vec<BatchRow> = state
            .rows
            .values()
            .filter(|r| r.batch == batch)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.line);
        rows
    }

    pub fn rowids_of(&self, batch: &str) -> Vec<i64> {
        self.rows_of(batch).iter().map(|r| r.rowid).collect()
    }

    /// Force rows into `inprog`, simulating a claim by another worker.
    pub fn mark_rows_inprog(&self, rowids: &[i64]) {
        let mut state = self.state.lock();
        let batches: HashSet<String> = rowids
            .iter()
            .filter_map(|id| state.rows.get(id).map(|r| r.batch.clone()))
            .collect();
        for rowid in rowids {
            if let Some(row) = state.rows.get_mut(rowid) {
                row.status = RowStatus::Inprog;
            }
        }
        for batch in batches {
            if let Some(b) = state.batches.get_mut(&batch) {
                if b.status == BatchStatus::Queued {
                    b.status = BatchStatus::Inprog;
                }
            }
        }
    }

    /// Force rows terminal without going through a worker.
    pub fn mark_rows_terminal(&self, rowids: &[i64], status: RowStatus, blobrows: Option<BlobRows>) {
        let mut state = self.state.lock();
        for rowid in rowids {
            if let Some(row) = state.rows.get_mut(rowid) {
                row.status = status;
                row.doneat = Some(Utc::now());
                row.res = Some(json!({}));
                row.blobrows = blobrows.clone();
                row.doneby = Some("external".to_string());
            }
        }
    }

    pub fn set_batch_status(&self, id: &str, status: BatchStatus) {
        if let Some(batch) = self.state.lock().batches.get_mut(id) {
            batch.status = status;
        }
    }

    /// Take the batch's advisory lock as if from a separate connection.
    pub fn lock_batch(&self, id: &str) -> Option<ExternalLock> {
        let mut state = self.state.lock();
        if state.advisory_locks.insert(id.to_string()) {
            Some(ExternalLock {
                state: self.state.clone(),
                batch: id.to_string(),
            })
        } else {
            None
        }
    }
}

pub struct MemTx {
    state: Arc<Mutex<MemState>>,
    held_locks: Vec<String>,
}

impl MemTx {
    fn release_locks(&mut self) {
        if self.held_locks.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for lock in self.held_locks.drain(..) {
            state.advisory_locks.remove(&lock);
        }
    }
}

impl Drop for MemTx {
    fn drop(&mut self) {
        self.release_locks();
    }
}

fn sorted_rows_where(state: &MemState, batch: &str, pred: impl Fn(&BatchRow) -> bool) -> Vec<BatchRow> {
    let mut rows: Vec<BatchRow> = state
        .rows
        .values()
        .filter(|r| r.batch == batch && pred(r))
        .cloned()
        .collect();
    rows.sort_by_key(|r| r.line);
    rows
}

#[async_trait]
impl Persistence for MemPersistence {
    async fn begin(&self) -> Result<Box<dyn PersistenceTx>> {
        Ok(Box::new(MemTx {
            state: self.state.clone(),
            held_locks: Vec::new(),
        }))
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        Ok(self.batch(id))
    }

    async fn get_batch_rows_sorted(&self, id: &str) -> Result<Vec<BatchRow>> {
        Ok(self.rows_of(id))
    }

    async fn get_unsummarized_batches(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut ids = Vec::new();
        for (id, batch) in &state.batches {
            if batch.status != BatchStatus::Inprog || batch.doneat.is_some() {
                continue;
            }
            let pending = state
                .rows
                .values()
                .any(|r| r.batch == *id && !r.status.is_terminal());
            if !pending {
                ids.push(id.clone());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl PersistenceTx for MemTx {
    async fn insert_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut state = self.state.lock();
        if state.batches.contains_key(&batch.id) {
            anyhow::bail!("duplicate batch id {}", batch.id);
        }
        state.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn bulk_insert_rows(
        &mut self,
        batch: &str,
        rows: &[NewRow],
        reqat: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for row in rows {
            state.next_rowid += 1;
            let rowid = state.next_rowid;
            state.rows.insert(
                rowid,
                BatchRow {
                    rowid,
                    batch: batch.to_string(),
                    line: row.line,
                    input: row.input.clone(),
                    status: RowStatus::Queued,
                    reqat,
                    doneat: None,
                    res: None,
                    blobrows: None,
                    messages: None,
                    doneby: None,
                },
            );
        }
        Ok(())
    }

    async fn fetch_block_of_rows(
        &mut self,
        status: RowStatus,
        limit: i64,
    ) -> Result<Vec<ClaimedRow>> {
        let state = self.state.lock();
        let mut claimed = Vec::new();
        for row in state.rows.values() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if row.status != status {
                continue;
            }
            let Some(batch) = state.batches.get(&row.batch) else {
                continue;
            };
            if batch.status == BatchStatus::Wait {
                continue;
            }
            claimed.push(ClaimedRow {
                app: batch.app.clone(),
                op: batch.op.clone(),
                context: batch.context.clone(),
                batch: batch.id.clone(),
                rowid: row.rowid,
                line: row.line,
                input: row.input.clone(),
                status: row.status,
            });
        }
        Ok(claimed)
    }

    async fn update_batches_status_bulk(
        &mut self,
        ids: &[String],
        to: BatchStatus,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(batch) = state.batches.get_mut(id) {
                if batch.status == BatchStatus::Queued {
                    batch.status = to;
                }
            }
        }
        Ok(())
    }

    async fn update_rows_status_bulk(&mut self, rowids: &[i64], to: RowStatus) -> Result<()> {
        let mut state = self.state.lock();
        for rowid in rowids {
            if let Some(row) = state.rows.get_mut(rowid) {
                row.status = to;
            }
        }
        Ok(())
    }

    async fn update_row_result(&mut self, result: &RowResult) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(row) = state.rows.get_mut(&result.rowid) {
            row.status = result.status;
            row.doneat = Some(result.doneat);
            row.res = Some(result.res.clone());
            row.blobrows = result.blobrows.clone();
            row.messages = if result.messages.is_empty() {
                None
            } else {
                Some(result.messages.clone())
            };
            row.doneby = Some(result.doneby.clone());
        }
        Ok(())
    }

    async fn reset_rows_to_queued(&mut self, rowids: &[i64]) -> Result<u64> {
        let mut state = self.state.lock();
        let mut reset = 0;
        for rowid in rowids {
            if let Some(row) = state.rows.get_mut(rowid) {
                if row.status == RowStatus::Inprog {
                    row.status = RowStatus::Queued;
                    row.doneby = None;
                    reset += 1;
                }
            }
        }
        Ok(reset)
    }

    async fn count_rows_queued(&mut self, batch: &str) -> Result<i64> {
        let state = self.state.lock();
        Ok(state
            .rows
            .values()
            .filter(|r| r.batch == batch && r.status == RowStatus::Queued)
            .count() as i64)
    }

    async fn count_rows_inprog(&mut self, batch: &str) -> Result<i64> {
        let state = self.state.lock();
        Ok(state
            .rows
            .values()
            .filter(|r| r.batch == batch && r.status == RowStatus::Inprog)
            .count() as i64)
    }

    async fn get_batch(&mut self, id: &str) -> Result<Option<Batch>> {
        Ok(self.state.lock().batches.get(id).cloned())
    }

    async fn get_batch_for_update(&mut self, id: &str) -> Result<Option<Batch>> {
        Ok(self.state.lock().batches.get(id).cloned())
    }

    async fn get_pending_rows(&mut self, batch: &str) -> Result<Vec<BatchRow>> {
        Ok(sorted_rows_where(&self.state.lock(), batch, |r| {
            !r.status.is_terminal()
        }))
    }

    async fn get_processed_rows_sorted(&mut self, batch: &str) -> Result<Vec<BatchRow>> {
        Ok(sorted_rows_where(&self.state.lock(), batch, |r| {
            r.status.is_terminal()
        }))
    }

    async fn get_rows_sorted(&mut self, batch: &str) -> Result<Vec<BatchRow>> {
        Ok(sorted_rows_where(&self.state.lock(), batch, |_| true))
    }

    async fn try_advisory_lock_batch(&mut self, batch: &str) -> Result<bool> {
        if self.held_locks.iter().any(|l| l == batch) {
            return Ok(true);
        }
        let mut state = self.state.lock();
        if state.advisory_locks.insert(batch.to_string()) {
            drop(state);
            self.held_locks.push(batch.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn update_batch_summary(&mut self, update: &BatchSummaryUpdate) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(batch) = state.batches.get_mut(&update.id) {
            batch.status = update.status;
            batch.doneat = Some(update.doneat);
            batch.outputfiles = Some(update.outputfiles.clone());
            batch.nsuccess = Some(update.nsuccess);
            batch.nfailed = Some(update.nfailed);
            batch.naborted = Some(update.naborted);
        }
        Ok(())
    }

    async fn update_batch_status(&mut self, id: &str, to: BatchStatus) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(batch) = state.batches.get_mut(id) {
            batch.status = to;
        }
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
        let mut state = self.state.lock();
        let mut failed = 0;
        for row in state.rows.values_mut() {
            if row.batch == batch && !row.status.is_terminal() {
                row.status = RowStatus::Failed;
                row.doneat = Some(doneat);
                row.res = Some(res.clone());
                row.messages = Some(messages.to_vec());
                row.doneby = Some(doneby.to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.release_locks();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.release_locks();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct KsState {
    statuses: HashMap<String, (BatchStatus, Duration)>,
    results: HashMap<String, Value>,
    output_files: HashMap<String, OutputFiles>,
    summaries: HashMap<String, BatchSummary>,
    workers: HashSet<String>,
    heartbeats: HashSet<String>,
    tracked: HashMap<String, HashSet<i64>>,
}

#[derive(Clone, Default)]
pub struct MemKeystore {
    state: Arc<Mutex<KsState>>,
}

impl MemKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_entry(&self, batch: &str) -> Option<(BatchStatus, Duration)> {
        self.state.lock().statuses.get(batch).copied()
    }

    pub fn workers(&self) -> Vec<String> {
        let mut members: Vec<String> = self.state.lock().workers.iter().cloned().collect();
        members.sort();
        members
    }

    pub fn has_heartbeat(&self, instance: &str) -> bool {
        self.state.lock().heartbeats.contains(instance)
    }

    pub fn tracked(&self, instance: &str) -> Option<Vec<i64>> {
        self.state.lock().tracked.get(instance).map(|rows| {
            let mut ids: Vec<i64> = rows.iter().copied().collect();
            ids.sort();
            ids
        })
    }

    /// Seed a dead worker: registered, tracked rows, no heartbeat.
    pub fn seed_dead_worker(&self, instance: &str, rowids: &[i64]) {
        let mut state = self.state.lock();
        state.workers.insert(instance.to_string());
        state
            .tracked
            .insert(instance.to_string(), rowids.iter().copied().collect());
    }
}

#[async_trait]
impl Keystore for MemKeystore {
    async fn get_batch_status(&self, batch: &str) -> Result<Option<BatchStatus>> {
        Ok(self.state.lock().statuses.get(batch).map(|(s, _)| *s))
    }

    async fn set_batch_status(
        &self,
        batch: &str,
        status: BatchStatus,
        ttl: Duration,
    ) -> Result<()> {
        self.state
            .lock()
            .statuses
            .insert(batch.to_string(), (status, ttl));
        Ok(())
    }

    async fn set_batch_caches(
        &self,
        batch: &str,
        status: BatchStatus,
        result: Option<&Value>,
        output_files: Option<&OutputFiles>,
        summary: Option<&BatchSummary>,
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.statuses.insert(batch.to_string(), (status, ttl));
        if let Some(result) = result {
            state.results.insert(batch.to_string(), result.clone());
        }
        if let Some(files) = output_files {
            state.output_files.insert(batch.to_string(), files.clone());
        }
        if let Some(summary) = summary {
            state.summaries.insert(batch.to_string(), summary.clone());
        }
        Ok(())
    }

    async fn get_batch_summary(&self, batch: &str) -> Result<Option<BatchSummary>> {
        Ok(self.state.lock().summaries.get(batch).cloned())
    }

    async fn get_batch_result(&self, batch: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().results.get(batch).cloned())
    }

    async fn register_worker(&self, instance: &str) -> Result<()> {
        self.state.lock().workers.insert(instance.to_string());
        Ok(())
    }

    async fn deregister_worker(&self, instance: &str) -> Result<()> {
        self.state.lock().workers.remove(instance);
        Ok(())
    }

    async fn worker_members(&self) -> Result<Vec<String>> {
        Ok(self.workers())
    }

    async fn set_heartbeat(&self, instance: &str, _ttl: Duration) -> Result<()> {
        self.state.lock().heartbeats.insert(instance.to_string());
        Ok(())
    }

    async fn delete_heartbeat(&self, instance: &str) -> Result<()> {
        self.state.lock().heartbeats.remove(instance);
        Ok(())
    }

    async fn heartbeat_exists(&self, instance: &str) -> Result<bool> {
        Ok(self.has_heartbeat(instance))
    }

    async fn track_rows(&self, instance: &str, rowids: &[i64], _ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state
            .tracked
            .entry(instance.to_string())
            .or_default()
            .extend(rowids.iter().copied());
        Ok(())
    }

    async fn untrack_row(&self, instance: &str, rowid: i64) -> Result<()> {
        if let Some(rows) = self.state.lock().tracked.get_mut(instance) {
            rows.remove(&rowid);
        }
        Ok(())
    }

    async fn tracked_rows(&self, instance: &str) -> Result<Vec<i64>> {
        Ok(self.tracked(instance).unwrap_or_default())
    }

    async fn delete_tracked_rows(&self, instance: &str) -> Result<()> {
        self.state.lock().tracked.remove(instance);
        Ok(())
    }

    async fn refresh_tracked_ttl(&self, _instance: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct NoopInit;

#[async_trait]
impl InitBlock for NoopInit {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopInitializer;

#[async_trait]
impl Initializer for NoopInitializer {
    async fn init(&self, _app: &str) -> Result<Arc<dyn InitBlock>> {
        Ok(Arc::new(NoopInit))
    }
}

/// Batch processor scripted per line: succeed with a `TX{line}` chunk in
/// the named blob, fail with a domain message, or panic.
pub struct ScriptedProcessor {
    pub blob_name: Option<String>,
    pub fail_lines: HashSet<i32>,
    pub panic_lines: HashSet<i32>,
    pub mark_done_calls: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn succeeding(blob_name: &str) -> Self {
        Self {
            blob_name: Some(blob_name.to_string()),
            fail_lines: HashSet::new(),
            panic_lines: HashSet::new(),
            mark_done_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_failures(blob_name: &str, fail_lines: &[i32]) -> Self {
        Self {
            fail_lines: fail_lines.iter().copied().collect(),
            ..Self::succeeding(blob_name)
        }
    }

    pub fn with_panics(blob_name: &str, panic_lines: &[i32]) -> Self {
        Self {
            panic_lines: panic_lines.iter().copied().collect(),
            ..Self::succeeding(blob_name)
        }
    }

    pub fn mark_done_count(&self) -> usize {
        self.mark_done_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchProcessor for ScriptedProcessor {
    async fn do_batch_job(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        line: i32,
        _input: &Value,
    ) -> Result<BatchOutput> {
        if self.panic_lines.contains(&line) {
            panic!("scripted panic on line {line}");
        }
        if self.fail_lines.contains(&line) {
            return Ok(BatchOutput::failed(
                json!({}),
                vec![ErrorMessage::new(100, "DOMAIN")],
            ));
        }
        let mut blobrows = BlobRows::new();
        if let Some(name) = &self.blob_name {
            blobrows.insert(name.clone(), format!("TX{line}"));
        }
        Ok(BatchOutput::success(json!({"line": line})).with_blobrows(blobrows))
    }

    async fn mark_done(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        _details: &BatchDetails,
    ) -> Result<()> {
        self.mark_done_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Slow-query processor that either returns a fixed result or fails.
pub struct ScriptedSlowQuery {
    pub fail: bool,
}

#[async_trait]
impl SlowQueryProcessor for ScriptedSlowQuery {
    async fn do_slow_query(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        input: &Value,
    ) -> Result<SlowQueryOutput> {
        if self.fail {
            anyhow::bail!("scripted slow-query failure");
        }
        let mut output_files = OutputFiles::new();
        output_files.insert("report".to_string(), "precomputed-object".to_string());
        Ok(SlowQueryOutput {
            status: RowStatus::Success,
            res: json!({"echo": input}),
            messages: Vec::new(),
            output_files,
        })
    }

    async fn mark_done(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        _details: &BatchDetails,
    ) -> Result<()> {
        Ok(())
    }
}
