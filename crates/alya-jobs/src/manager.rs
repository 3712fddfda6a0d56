//! The worker supervisor.
//!
//! One iteration claims a block of queued rows under row locks, promotes
//! them to `inprog`, commits, tracks them in the keystore, dispatches each
//! row, then summarizes the affected batches. Panics are contained in
//! three layers: a panicking row becomes a failed row, a panicking
//! iteration rolls back and claims nothing, and a run of consecutive
//! iteration panics trips the circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use alya_config::JobsConfig;
use alya_core::registry::ProcessorRegistry;
use alya_core::store::{Keystore, ObjectStore, Persistence};
use alya_core::types::{BatchStatus, RowStatus};

use crate::dispatch;
use crate::liveness;
use crate::summarize;

/// Shared state of one worker process.
pub(crate) struct Ctx {
    pub store: Arc<dyn Persistence>,
    pub keystore: Arc<dyn Keystore>,
    pub objects: Arc<dyn ObjectStore>,
    pub registry: Arc<ProcessorRegistry>,
    pub cfg: JobsConfig,
    pub instance_id: String,
}

pub struct JobManager {
    ctx: Arc<Ctx>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn Persistence>,
        keystore: Arc<dyn Keystore>,
        objects: Arc<dyn ObjectStore>,
        registry: Arc<ProcessorRegistry>,
        cfg: JobsConfig,
    ) -> Self {
        let instance_id = liveness::instance_id();
        Self {
            ctx: Arc::new(Ctx {
                store,
                keystore,
                objects,
                registry,
                cfg,
                instance_id,
            }),
        }
    }

    /// The id this worker registers under: `hostname-pid-nanos`.
    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    /// Run the supervisor and the background liveness tasks until `token`
    /// is cancelled or the panic circuit breaker trips.
    pub async fn run_with_context(&self, token: CancellationToken) -> Result<()> {
        let ctx = &self.ctx;
        if let Err(e) = ctx.keystore.register_worker(&ctx.instance_id).await {
            warn!(error = %e, "failed to register worker; heartbeat will retry");
        }
        if let Err(e) = ctx
            .keystore
            .set_heartbeat(&ctx.instance_id, ctx.cfg.heartbeat_ttl())
            .await
        {
            warn!(error = %e, "failed to publish initial heartbeat");
        }
        info!(instance = %ctx.instance_id, "worker starting");

        let background = token.child_token();
        let heartbeat = tokio::spawn(liveness::heartbeat_loop(
            ctx.clone(),
            background.clone(),
        ));
        let recovery = tokio::spawn(liveness::recovery_loop(ctx.clone(), background.clone()));
        let sweep = tokio::spawn(liveness::sweep_loop(ctx.clone(), background.clone()));

        let result = self.supervise(&token).await;

        background.cancel();
        let _ = heartbeat.await;
        let _ = recovery.await;
        let _ = sweep.await;

        // Shutdown: drop our presence so peers recover anything mid-flight,
        // but keep the active-rows set; recovery reads it.
        if let Err(e) = ctx.keystore.delete_heartbeat(&ctx.instance_id).await {
            warn!(error = %e, "failed to delete heartbeat during shutdown");
        }
        if let Err(e) = ctx.keystore.deregister_worker(&ctx.instance_id).await {
            warn!(error = %e, "failed to deregister worker during shutdown");
        }
        cleanup_init_blocks(ctx).await;
        info!(instance = %ctx.instance_id, "worker stopped");
        result
    }

    async fn supervise(&self, token: &CancellationToken) -> Result<()> {
        let mut consecutive_panics: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let ctx = self.ctx.clone();
            let iter_token = token.clone();
            let handle =
                tokio::spawn(async move { run_iteration(&ctx, &iter_token).await });

            match handle.await {
                Ok(Ok(processed)) => {
                    consecutive_panics = 0;
                    if processed == 0 {
                        self.backoff(token).await;
                    }
                }
                Ok(Err(e)) => {
                    consecutive_panics = 0;
                    warn!(error = format!("{e:#}"), "iteration failed; backing off");
                    self.backoff(token).await;
                }
                Err(join_err) if join_err.is_panic() => {
                    consecutive_panics += 1;
                    error!(
                        panic = %panic_message(join_err.into_panic()),
                        consecutive = consecutive_panics,
                        "iteration panicked"
                    );
                    if consecutive_panics >= self.ctx.cfg.max_consecutive_panics {
                        anyhow::bail!(
                            "{} consecutive iteration panics; stopping worker",
                            consecutive_panics
                        );
                    }
                    self.backoff(token).await;
                }
                Err(_) => return Ok(()),
            }
        }
    }

    /// Sleep for a uniform-random duration in
    /// [polling * 2/3, polling * 4/3], waking early on cancellation.
    async fn backoff(&self, token: &CancellationToken) {
        let poll_ms = self.ctx.cfg.polling_interval().as_millis() as u64;
        let wait = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(poll_ms * 2 / 3..=poll_ms * 4 / 3))
        };
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Claim and process a single block. Exposed for embedders that drive
    /// the loop themselves (and for tests).
    pub async fn run_once(&self) -> Result<usize> {
        run_iteration(&self.ctx, &CancellationToken::new()).await
    }

    /// One recovery pass over the worker registry; requeues rows tracked
    /// by workers whose heartbeat has expired.
    pub async fn recover_abandoned_rows(&self) -> Result<()> {
        liveness::recover_abandoned_rows(&self.ctx).await
    }

    /// Summarize the given batches, with the usual contention retry.
    pub async fn summarize_batches(&self, batches: &[String]) {
        let set = batches.iter().cloned().collect();
        summarize::summarize_completed_batches(&self.ctx, &set).await;
    }

    /// One sweep pass: summarize every batch whose inline summarization
    /// was missed.
    pub async fn sweep_once(&self) -> Result<()> {
        let ids = self.ctx.store.get_unsummarized_batches().await?;
        if !ids.is_empty() {
            info!(count = ids.len(), "sweeping batches that missed summarization");
            let set = ids.into_iter().collect();
            summarize::summarize_completed_batches(&self.ctx, &set).await;
        }
        Ok(())
    }
}

async fn run_iteration(ctx: &Arc<Ctx>, token: &CancellationToken) -> Result<usize> {
    if token.is_cancelled() {
        return Ok(0);
    }

    let mut tx = ctx.store.begin().await?;
    let claimed = tx
        .fetch_block_of_rows(RowStatus::Queued, ctx.cfg.chunk_rows)
        .await?;
    if claimed.is_empty() {
        tx.rollback().await?;
        return Ok(0);
    }
    if token.is_cancelled() {
        tx.rollback().await?;
        return Ok(0);
    }

    let mut batch_ids: Vec<String> = claimed.iter().map(|r| r.batch.clone()).collect();
    batch_ids.sort();
    batch_ids.dedup();
    let rowids: Vec<i64> = claimed.iter().map(|r| r.rowid).collect();

    tx.update_batches_status_bulk(&batch_ids, BatchStatus::Inprog)
        .await?;
    tx.update_rows_status_bulk(&rowids, RowStatus::Inprog).await?;

    if token.is_cancelled() {
        tx.rollback().await?;
        return Ok(0);
    }
    tx.commit().await?;

    if let Err(e) = ctx
        .keystore
        .track_rows(&ctx.instance_id, &rowids, ctx.cfg.worker_rows_ttl())
        .await
    {
        warn!(error = %e, "failed to track claimed rows in keystore");
    }

    // From here the block is processed to completion even if cancellation
    // arrives; abandoning committed inprog rows is recovery's job, not ours.
    let claimed_count = claimed.len();
    let outcome = dispatch::dispatch_block(ctx, claimed).await;

    if !token.is_cancelled() {
        summarize::summarize_completed_batches(ctx, &outcome.batches_to_summarize).await;
    }

    cleanup_init_blocks(ctx).await;
    Ok(claimed_count)
}

pub(crate) async fn cleanup_init_blocks(ctx: &Ctx) {
    for (app, block) in ctx.registry.release_init_blocks() {
        if let Err(e) = block.close().await {
            warn!(app = %app, error = %e, "failed to close init block");
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_extracts_both_string_kinds() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("kaboom"))), "kaboom");
        assert_eq!(panic_message(Box::new(42_u8)), "non-string panic payload");
    }
}
