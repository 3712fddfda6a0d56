//! Per-row dispatch.
//!
//! Each claimed row resolves its processor, runs it in an isolated task
//! (a panic becomes a typed processing failure), and records the terminal
//! result. Configuration errors widen: every still-pending row of the
//! affected batch is failed with the same message and the batch itself is
//! failed; the summarizer then finalizes counts and `doneat`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use alya_core::error::{ConfigurationError, ERRCODE_PROCESSING, MSGID_PROCESSING_ERROR};
use alya_core::processor::{BatchProcessor, InitBlock, SlowQueryProcessor};
use alya_core::registry::RegisteredProcessor;
use alya_core::store::{BatchSummaryUpdate, RowResult};
use alya_core::types::{
    BatchDetails, BatchOutput, BatchStatus, ClaimedRow, ErrorMessage, OutputFiles, RowStatus,
    SlowQueryOutput,
};

use crate::manager::{panic_message, Ctx};

pub(crate) struct BlockOutcome {
    /// Ordinary batches touched by this block; the summarize phase checks
    /// each for completion. Slow-query batches are finalized inline.
    pub batches_to_summarize: BTreeSet<String>,
}

enum RowDisposition {
    Batch,
    SlowQuery,
}

pub(crate) async fn dispatch_block(ctx: &Arc<Ctx>, rows: Vec<ClaimedRow>) -> BlockOutcome {
    let mut batches_to_summarize = BTreeSet::new();
    // A batch's rows share (app, op), so one configuration failure covers
    // every sibling row; dedupe keeps the bulk update from repeating.
    let mut widened: HashSet<String> = HashSet::new();

    for row in rows {
        if widened.contains(&row.batch) {
            untrack(ctx, row.rowid).await;
            continue;
        }

        match dispatch_row(ctx, &row).await {
            Ok(RowDisposition::Batch) => {
                batches_to_summarize.insert(row.batch.clone());
            }
            Ok(RowDisposition::SlowQuery) => {}
            Err(e) => match e.downcast::<ConfigurationError>() {
                Ok(config_err) => {
                    match widen_configuration_failure(ctx, &row.batch, &config_err).await {
                        Ok(()) => {
                            widened.insert(row.batch.clone());
                            batches_to_summarize.insert(row.batch.clone());
                            untrack(ctx, row.rowid).await;
                        }
                        Err(e) => {
                            error!(
                                batch = %row.batch,
                                error = format!("{e:#}"),
                                "failed to widen configuration error; leaving rows for recovery"
                            );
                        }
                    }
                }
                Err(e) => {
                    // Transient failure writing the result; the row stays
                    // tracked and inprog so recovery can requeue it.
                    error!(
                        rowid = row.rowid,
                        batch = %row.batch,
                        error = format!("{e:#}"),
                        "failed to record row result"
                    );
                }
            },
        }
    }

    BlockOutcome {
        batches_to_summarize,
    }
}

async fn dispatch_row(ctx: &Arc<Ctx>, row: &ClaimedRow) -> Result<RowDisposition> {
    enum Resolved {
        Batch(Arc<dyn BatchProcessor>),
        Slow(Arc<dyn SlowQueryProcessor>),
    }

    let resolved = match (
        ctx.registry.get_processor(&row.app, &row.op),
        row.is_slow_query(),
    ) {
        (None, _) => {
            return Err(ConfigurationError::ProcessorNotFound {
                app: row.app.clone(),
                op: row.op.clone(),
            }
            .into())
        }
        (Some(RegisteredProcessor::SlowQuery(p)), true) => Resolved::Slow(p),
        (Some(RegisteredProcessor::Batch(p)), false) => Resolved::Batch(p),
        (Some(RegisteredProcessor::Batch(_)), true) => {
            return Err(ConfigurationError::WrongProcessorKind {
                app: row.app.clone(),
                op: row.op.clone(),
                expected: "slow-query",
            }
            .into())
        }
        (Some(RegisteredProcessor::SlowQuery(_)), false) => {
            return Err(ConfigurationError::WrongProcessorKind {
                app: row.app.clone(),
                op: row.op.clone(),
                expected: "batch",
            }
            .into())
        }
    };

    // Configuration errors from the registry propagate typed through
    // anyhow; the block loop widens them.
    let init = ctx.registry.get_or_create_init_block(&row.app).await?;

    match resolved {
        Resolved::Batch(processor) => {
            let output = run_batch_processor(processor, init, row).await;
            record_batch_row(ctx, row, output).await?;
            untrack(ctx, row.rowid).await;
            Ok(RowDisposition::Batch)
        }
        Resolved::Slow(processor) => {
            let started = Instant::now();
            let output = run_slow_query_processor(processor.clone(), init.clone(), row).await;
            if started.elapsed() > ctx.cfg.slow_query_warn() {
                warn!(
                    batch = %row.batch,
                    elapsed_secs = started.elapsed().as_secs(),
                    "slow query ran long"
                );
            }
            finalize_slow_query(ctx, row, processor, init, output).await?;
            untrack(ctx, row.rowid).await;
            Ok(RowDisposition::SlowQuery)
        }
    }
}

fn processing_failure(reason: String) -> (Value, Vec<ErrorMessage>) {
    (
        json!({}),
        vec![ErrorMessage::new(MSGID_PROCESSING_ERROR, ERRCODE_PROCESSING).with_vals(vec![reason])],
    )
}

/// Run user code in its own task so a panic is contained to this row.
async fn run_batch_processor(
    processor: Arc<dyn BatchProcessor>,
    init: Arc<dyn InitBlock>,
    row: &ClaimedRow,
) -> BatchOutput {
    let context = row.context.clone();
    let input = row.input.clone();
    let line = row.line;
    let handle = tokio::spawn(async move {
        processor
            .do_batch_job(init.as_ref(), &context, line, &input)
            .await
    });
    match handle.await {
        Ok(Ok(output)) if output.status.is_terminal() => output,
        Ok(Ok(output)) => {
            let (res, messages) = processing_failure(format!(
                "processor returned non-terminal row status {}",
                output.status
            ));
            BatchOutput::failed(res, messages)
        }
        Ok(Err(e)) => {
            let (res, messages) = processing_failure(format!("{e:#}"));
            BatchOutput::failed(res, messages)
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                format!("processor panicked: {}", panic_message(join_err.into_panic()))
            } else {
                "processor task was cancelled".to_string()
            };
            let (res, messages) = processing_failure(reason);
            BatchOutput::failed(res, messages)
        }
    }
}

async fn run_slow_query_processor(
    processor: Arc<dyn SlowQueryProcessor>,
    init: Arc<dyn InitBlock>,
    row: &ClaimedRow,
) -> SlowQueryOutput {
    let context = row.context.clone();
    let input = row.input.clone();
    let handle = tokio::spawn(async move {
        processor
            .do_slow_query(init.as_ref(), &context, &input)
            .await
    });
    match handle.await {
        Ok(Ok(output)) if output.status.is_terminal() => output,
        Ok(Ok(output)) => {
            let (res, messages) = processing_failure(format!(
                "processor returned non-terminal row status {}",
                output.status
            ));
            SlowQueryOutput {
                status: RowStatus::Failed,
                res,
                messages,
                output_files: OutputFiles::new(),
            }
        }
        Ok(Err(e)) => {
            let (res, messages) = processing_failure(format!("{e:#}"));
            SlowQueryOutput {
                status: RowStatus::Failed,
                res,
                messages,
                output_files: OutputFiles::new(),
            }
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                format!("processor panicked: {}", panic_message(join_err.into_panic()))
            } else {
                "processor task was cancelled".to_string()
            };
            let (res, messages) = processing_failure(reason);
            SlowQueryOutput {
                status: RowStatus::Failed,
                res,
                messages,
                output_files: OutputFiles::new(),
            }
        }
    }
}

async fn record_batch_row(ctx: &Arc<Ctx>, row: &ClaimedRow, output: BatchOutput) -> Result<()> {
    let mut tx = ctx.store.begin().await?;
    tx.update_row_result(&RowResult {
        rowid: row.rowid,
        status: output.status,
        doneat: Utc::now(),
        res: output.res,
        blobrows: if output.blobrows.is_empty() {
            None
        } else {
            Some(output.blobrows)
        },
        messages: output.messages,
        doneby: ctx.instance_id.clone(),
    })
    .await?;
    tx.commit().await?;
    Ok(())
}

/// A slow-query batch has exactly one row, so its terminal row write and
/// the batch finalization happen together, without the summarizer.
async fn finalize_slow_query(
    ctx: &Arc<Ctx>,
    row: &ClaimedRow,
    processor: Arc<dyn SlowQueryProcessor>,
    init: Arc<dyn InitBlock>,
    output: SlowQueryOutput,
) -> Result<()> {
    let now = Utc::now();
    let batch_status = match output.status {
        RowStatus::Success => BatchStatus::Success,
        RowStatus::Aborted => BatchStatus::Aborted,
        _ => BatchStatus::Failed,
    };
    // TODO(product): a failed slow query discards any partial output files
    // it reported; clarify whether they should be kept.
    let output_files = if output.status == RowStatus::Success {
        output.output_files
    } else {
        OutputFiles::new()
    };
    let (n_success, n_failed, n_aborted) = match batch_status {
        BatchStatus::Success => (1, 0, 0),
        BatchStatus::Aborted => (0, 0, 1),
        _ => (0, 1, 0),
    };

    let mut tx = ctx.store.begin().await?;
    tx.update_row_result(&RowResult {
        rowid: row.rowid,
        status: output.status,
        doneat: now,
        res: output.res.clone(),
        blobrows: None,
        messages: output.messages.clone(),
        doneby: ctx.instance_id.clone(),
    })
    .await?;
    tx.update_batch_summary(&BatchSummaryUpdate {
        id: row.batch.clone(),
        status: batch_status,
        doneat: now,
        outputfiles: output_files.clone(),
        nsuccess: n_success,
        nfailed: n_failed,
        naborted: n_aborted,
    })
    .await?;
    tx.commit().await?;

    let summary = alya_core::types::BatchSummary {
        status: batch_status,
        output_files: output_files.clone(),
        n_success,
        n_failed,
        n_aborted,
    };
    if let Err(e) = ctx
        .keystore
        .set_batch_caches(
            &row.batch,
            batch_status,
            Some(&output.res),
            Some(&output_files),
            Some(&summary),
            ctx.cfg.terminal_cache_ttl(),
        )
        .await
    {
        warn!(batch = %row.batch, error = %e, "failed to cache slow-query result");
    }

    let details = BatchDetails {
        id: row.batch.clone(),
        app: row.app.clone(),
        op: row.op.clone(),
        context: row.context.clone(),
        status: batch_status,
        output_files,
        n_success,
        n_failed,
        n_aborted,
    };
    let context = row.context.clone();
    let handle =
        tokio::spawn(async move { processor.mark_done(init.as_ref(), &context, &details).await });
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(batch = %row.batch, error = format!("{e:#}"), "mark_done failed"),
        Err(join_err) if join_err.is_panic() => warn!(
            batch = %row.batch,
            panic = %panic_message(join_err.into_panic()),
            "mark_done panicked"
        ),
        Err(_) => {}
    }
    Ok(())
}

async fn widen_configuration_failure(
    ctx: &Arc<Ctx>,
    batch: &str,
    err: &ConfigurationError,
) -> Result<()> {
    let now = Utc::now();
    let res = json!({});
    let messages = [err.to_message()];
    let mut tx = ctx.store.begin().await?;
    let failed = tx
        .fail_pending_rows(batch, now, &res, &messages, &ctx.instance_id)
        .await?;
    tx.update_batch_status(batch, BatchStatus::Failed).await?;
    tx.commit().await?;
    info!(
        batch = %batch,
        rows = failed,
        error = %err,
        "configuration error widened across batch"
    );
    Ok(())
}

async fn untrack(ctx: &Arc<Ctx>, rowid: i64) {
    // Must also run during shutdown; a stale entry would make recovery
    // try to resurrect a row that already finished.
    if let Err(e) = ctx.keystore.untrack_row(&ctx.instance_id, rowid).await {
        warn!(rowid, error = %e, "failed to untrack row");
    }
}
