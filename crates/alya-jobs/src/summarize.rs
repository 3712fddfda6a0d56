//! Batch summarization.
//!
//! Moves a batch from `inprog` to its terminal status: counts terminal
//! rows, assembles each logical output file from the rows' blobrows in
//! `line` order, uploads the files, writes `doneat` plus counts, refreshes
//! the caches, and fires `mark_done`. A per-batch advisory lock serializes
//! attempts; `doneat` is re-checked under the lock so a losing attempt
//! converges without uploading anything.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};
use uuid::Uuid;

use alya_core::error::SummarizeError;
use alya_core::registry::RegisteredProcessor;
use alya_core::store::BatchSummaryUpdate;
use alya_core::types::{
    Batch, BatchDetails, BatchRow, BatchStatus, BatchSummary, OutputFiles, RowStatus,
};

use crate::manager::{panic_message, Ctx};

const OUTPUT_CONTENT_TYPE: &str = "application/octet-stream";

/// Summarize each batch, retrying on lock contention and stale snapshots.
/// Counts observed inside one transaction reflect its snapshot, so every
/// retry opens a fresh transaction.
pub(crate) async fn summarize_completed_batches(ctx: &Arc<Ctx>, batches: &BTreeSet<String>) {
    for id in batches {
        let max_retries = ctx.cfg.summarize_max_retries.max(1);
        for attempt in 1..=max_retries {
            match summarize_batch(ctx, id).await {
                Ok(()) => break,
                Err(e) if e.is::<SummarizeError>() => {
                    debug!(batch = %id, attempt, reason = %e, "summarize attempt lost; retrying");
                    if attempt == max_retries {
                        warn!(batch = %id, "summarize retries exhausted; the sweep will retry");
                    } else {
                        tokio::time::sleep(ctx.cfg.summarize_retry_delay()).await;
                    }
                }
                Err(e) => {
                    error!(
                        batch = %id,
                        error = format!("{e:#}"),
                        "summarize failed; skipping this cycle"
                    );
                    break;
                }
            }
        }
    }
}

async fn summarize_batch(ctx: &Arc<Ctx>, id: &str) -> Result<()> {
    let mut tx = ctx.store.begin().await?;

    if !tx.try_advisory_lock_batch(id).await? {
        tx.rollback().await?;
        return Err(SummarizeError::LockNotAcquired.into());
    }

    let Some(batch) = tx.get_batch(id).await? else {
        tx.rollback().await?;
        anyhow::bail!("batch {} vanished during summarization", id);
    };
    if batch.doneat.is_some() {
        // Another worker finished first; converge without uploading.
        tx.rollback().await?;
        return Ok(());
    }

    // Queued first: a cheap, definitive "not yet".
    if tx.count_rows_queued(id).await? > 0 {
        tx.rollback().await?;
        return Ok(());
    }
    if tx.count_rows_inprog(id).await? > 0 {
        tx.rollback().await?;
        return Err(SummarizeError::PendingRows.into());
    }

    let rows = tx.get_rows_sorted(id).await?;
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
    let status = if n_aborted > 0 {
        BatchStatus::Aborted
    } else if n_failed > 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::Success
    };

    let processed = tx.get_processed_rows_sorted(id).await?;
    // Temp files delete themselves when `files` leaves scope, commit or not.
    let files = assemble_blob_files(&processed)?;
    let mut output_files = OutputFiles::new();
    for (logical, file) in &files {
        let data = tokio::fs::read(file.path())
            .await
            .with_context(|| format!("Failed to read assembled file for {}", logical))?;
        let object = Uuid::new_v4().simple().to_string();
        ctx.objects
            .put(&ctx.cfg.output_bucket, &object, data, OUTPUT_CONTENT_TYPE)
            .await?;
        output_files.insert(logical.clone(), object);
    }

    let now = Utc::now();
    tx.update_batch_summary(&BatchSummaryUpdate {
        id: id.to_string(),
        status,
        doneat: now,
        outputfiles: output_files.clone(),
        nsuccess: n_success,
        nfailed: n_failed,
        naborted: n_aborted,
    })
    .await?;
    tx.commit().await?;

    let summary = BatchSummary {
        status,
        output_files: output_files.clone(),
        n_success,
        n_failed,
        n_aborted,
    };
    if let Err(e) = ctx
        .keystore
        .set_batch_caches(
            id,
            status,
            None,
            Some(&output_files),
            Some(&summary),
            ctx.cfg.terminal_cache_ttl(),
        )
        .await
    {
        warn!(batch = %id, error = %e, "failed to refresh batch caches after summarize");
    }

    invoke_mark_done(ctx, &batch, status, output_files, n_success, n_failed, n_aborted).await;
    Ok(())
}

/// Build one temp file per logical name, appending each row's chunk in
/// ascending `line` order with a trailing newline; empty chunks are
/// skipped. `rows` must already be line-sorted.
pub(crate) fn assemble_blob_files(rows: &[BatchRow]) -> Result<HashMap<String, NamedTempFile>> {
    let mut files: HashMap<String, NamedTempFile> = HashMap::new();
    for row in rows {
        let Some(blobrows) = &row.blobrows else {
            continue;
        };
        let mut names: Vec<&String> = blobrows.keys().collect();
        names.sort();
        for name in names {
            let chunk = &blobrows[name];
            if chunk.is_empty() {
                continue;
            }
            let file = match files.entry(name.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => entry.insert(
                    NamedTempFile::new().context("Failed to create output temp file")?,
                ),
            };
            file.write_all(chunk.as_bytes())?;
            file.write_all(b"\n")?;
        }
    }
    Ok(files)
}

async fn invoke_mark_done(
    ctx: &Arc<Ctx>,
    batch: &Batch,
    status: BatchStatus,
    output_files: OutputFiles,
    n_success: i32,
    n_failed: i32,
    n_aborted: i32,
) {
    let Some(registered) = ctx.registry.get_processor(&batch.app, &batch.op) else {
        debug!(batch = %batch.id, "no processor registered; skipping mark_done");
        return;
    };
    let init = match ctx.registry.get_or_create_init_block(&batch.app).await {
        Ok(init) => init,
        Err(e) => {
            warn!(batch = %batch.id, error = format!("{e:#}"), "no init block for mark_done");
            return;
        }
    };

    let details = BatchDetails {
        id: batch.id.clone(),
        app: batch.app.clone(),
        op: batch.op.clone(),
        context: batch.context.clone(),
        status,
        output_files,
        n_success,
        n_failed,
        n_aborted,
    };
    let context = batch.context.clone();
    let handle = tokio::spawn(async move {
        match registered {
            RegisteredProcessor::Batch(p) => p.mark_done(init.as_ref(), &context, &details).await,
            RegisteredProcessor::SlowQuery(p) => {
                p.mark_done(init.as_ref(), &context, &details).await
            }
        }
    });
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(batch = %batch.id, error = format!("{e:#}"), "mark_done failed"),
        Err(join_err) if join_err.is_panic() => warn!(
            batch = %batch.id,
            panic = %panic_message(join_err.into_panic()),
            "mark_done panicked"
        ),
        Err(_) => {}
    }
}
