//! Worker liveness: heartbeat, recovery, and the summarization sweep.
//!
//! Liveness truth is the combination of registry membership and heartbeat
//! existence: a registered worker without a heartbeat is dead, and its
//! tracked rows go back to `queued`. Every step of recovery is idempotent,
//! so two workers recovering the same corpse, or a crash mid-recovery,
//! converge to the same state.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::Ctx;
use crate::summarize;

/// `hostname-pid-nanos`, computed once per worker lifetime.
pub(crate) fn instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{}-{}", host, std::process::id(), nanos)
}

/// Re-assert this worker's presence on a fixed interval. Registration is
/// re-added each beat (SADD is idempotent) so a registry trimmed by a
/// mistaken recovery heals itself.
pub(crate) async fn heartbeat_loop(ctx: Arc<Ctx>, token: CancellationToken) {
    let mut tick = tokio::time::interval(ctx.cfg.heartbeat_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tick.tick() => {}
        }
        if let Err(e) = ctx.keystore.register_worker(&ctx.instance_id).await {
            warn!(error = %e, "heartbeat: failed to re-register worker");
        }
        if let Err(e) = ctx
            .keystore
            .set_heartbeat(&ctx.instance_id, ctx.cfg.heartbeat_ttl())
            .await
        {
            warn!(error = %e, "heartbeat: failed to refresh heartbeat key");
        }
        if let Err(e) = ctx
            .keystore
            .refresh_tracked_ttl(&ctx.instance_id, ctx.cfg.worker_rows_ttl())
            .await
        {
            warn!(error = %e, "heartbeat: failed to refresh active-rows ttl");
        }
    }
}

/// Periodic recovery, run immediately at startup and then on the
/// configured interval. A pass always runs to completion; cancellation is
/// honored only between passes.
pub(crate) async fn recovery_loop(ctx: Arc<Ctx>, token: CancellationToken) {
    loop {
        if let Err(e) = recover_abandoned_rows(&ctx).await {
            warn!(error = format!("{e:#}"), "recovery pass failed");
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(ctx.cfg.recovery_interval()) => {}
        }
    }
}

/// Requeue rows tracked by workers whose heartbeat has expired.
///
/// The order is load-bearing: reset rows in the database, then delete the
/// tracked set, then drop the registry entry. Dying between any two steps
/// leaves state the next pass handles (the inprog guard turns the repeated
/// reset into a no-op). Unlike the rest of the keystore surface, recovery
/// cannot proceed without it, so errors propagate.
pub(crate) async fn recover_abandoned_rows(ctx: &Ctx) -> Result<()> {
    let members = ctx.keystore.worker_members().await?;
    for instance in members {
        if instance == ctx.instance_id {
            continue;
        }
        if ctx.keystore.heartbeat_exists(&instance).await? {
            continue;
        }

        let rowids = ctx.keystore.tracked_rows(&instance).await?;
        if !rowids.is_empty() {
            let mut tx = ctx.store.begin().await?;
            let recovered = tx.reset_rows_to_queued(&rowids).await?;
            tx.commit().await?;
            info!(
                dead = %instance,
                tracked = rowids.len(),
                recovered,
                "requeued rows abandoned by dead worker"
            );
        }
        ctx.keystore.delete_tracked_rows(&instance).await?;
        ctx.keystore.deregister_worker(&instance).await?;
    }
    Ok(())
}

/// Safety net for batches whose inline summarization was missed (a worker
/// died between the last row commit and the summarize phase, or every
/// retry lost the advisory lock). Runs at a uniform-random interval so a
/// fleet of workers does not sweep in lockstep.
pub(crate) async fn sweep_loop(ctx: Arc<Ctx>, token: CancellationToken) {
    loop {
        let wait = {
            let mut rng = rand::thread_rng();
            let secs = rng.gen_range(ctx.cfg.sweep_min_secs..ctx.cfg.sweep_max_secs);
            std::time::Duration::from_secs(secs)
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        match ctx.store.get_unsummarized_batches().await {
            Ok(ids) if !ids.is_empty() => {
                info!(count = ids.len(), "sweeping batches that missed summarization");
                let set = ids.into_iter().collect();
                summarize::summarize_completed_batches(&ctx, &set).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = format!("{e:#}"), "sweep scan failed"),
        }
    }
}
