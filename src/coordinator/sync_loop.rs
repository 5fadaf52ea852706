// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation loop: relays the store queue to the pub/sub transport.
//!
//! Every node appends its merged writes to the shared queue table. This loop
//! polls that queue from the last checkpoint and republishes what it finds,
//! which redelivers anything a node missed while offline or a dropped
//! pub/sub message.
//!
//! # Algorithm
//!
//! 1. Sleep `interval` (or stop on shutdown)
//! 2. `fetch_dirty(checkpoint)` until a short batch comes back
//! 3. Merge each row into the local cache and publish it to sinks that
//!    relay reconciliation (pub/sub only)
//! 4. Advance the checkpoint once the batch is published
//! 5. Prune queue entries older than the retention window
//!
//! The next sleep starts only after the pass finishes, so a slow database
//! stretches the period instead of stacking passes. Failures end the pass
//! and the same checkpoint is retried next tick; the loop itself only
//! exits on shutdown.
//!
//! The local merge matters because listeners drop our own relays as
//! self-origin, so a row written by a node with no transports would
//! otherwise never reach this cache.
//!
//! The broker is fed by writers only and never receives queue rows.

use crate::cache::PlayerCache;
use crate::config::SyncConfig;
use crate::metrics;
use crate::record::now_millis;
use crate::store::PlayerStore;
use crate::transport::{publish_upsert_to, DeltaSink, TransportKind};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Statistics from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Batches fetched from the queue
    pub batches: usize,
    /// Rows fetched
    pub rows: usize,
    /// Rows that changed the local cache
    pub applied: usize,
    /// Successful (row, sink) publishes
    pub published: usize,
    /// Rows pruned from the queue
    pub pruned: u64,
    /// Failed store or publish steps
    pub errors: usize,
}

/// Run the reconciliation loop until shutdown is signaled.
pub async fn run_sync_loop(
    store: Arc<PlayerStore>,
    cache: Arc<PlayerCache>,
    sinks: Vec<Arc<dyn DeltaSink>>,
    config: SyncConfig,
    fetch_batch_size: usize,
    checkpoint: Arc<AtomicI64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("sync_loop");

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        let interval = config.interval_duration();
        let relays = sinks
            .iter()
            .filter(|s| s.kind().relays_reconciliation())
            .count();

        info!(
            interval_ms = interval.as_millis() as u64,
            relays,
            checkpoint = checkpoint.load(Ordering::Acquire),
            "Starting sync loop"
        );

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping sync loop");
                        break;
                    }
                    continue;
                }

                _ = tokio::time::sleep(interval) => {}
            }

            let started = Instant::now();
            let stats = run_sync_pass(&store, &cache, &sinks, &config, fetch_batch_size, &checkpoint).await;
            metrics::record_sync_tick(stats.rows, stats.published, stats.errors, started.elapsed());

            if stats.rows > 0 || stats.errors > 0 {
                debug!(
                    rows = stats.rows,
                    applied = stats.applied,
                    published = stats.published,
                    pruned = stats.pruned,
                    errors = stats.errors,
                    checkpoint = checkpoint.load(Ordering::Acquire),
                    "Sync pass complete"
                );
            }
        }

        info!("Sync loop stopped");
    }
    .instrument(span)
    .await
}

/// One reconciliation pass: drain the queue from `checkpoint`, publish,
/// then prune. Never fails; problems are logged and counted in the stats.
pub async fn run_sync_pass(
    store: &PlayerStore,
    cache: &PlayerCache,
    sinks: &[Arc<dyn DeltaSink>],
    config: &SyncConfig,
    fetch_batch_size: usize,
    checkpoint: &AtomicI64,
) -> SyncStats {
    let mut stats = SyncStats::default();
    let relays = sinks
        .iter()
        .filter(|s| s.kind().relays_reconciliation())
        .count();

    'drain: loop {
        let from = checkpoint.load(Ordering::Acquire);
        let batch = match store.fetch_dirty(from).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(checkpoint = from, error = %e, "Failed to fetch dirty rows, retrying next tick");
                stats.errors += 1;
                break;
            }
        };
        stats.batches += 1;
        stats.rows += batch.len();

        for row in &batch.rows {
            match cache.add(row.clone()).await {
                Ok(outcome) => {
                    metrics::record_cache_apply("sync", outcome.as_str());
                    if outcome.changed() {
                        stats.applied += 1;
                    }
                }
                Err(e) => warn!(uuid = %row.uuid, error = %e, "Cache rejected queued row"),
            }

            let delivered = publish_upsert_to(sinks, row, relays_reconciliation).await;
            stats.published += delivered;
            if delivered < relays {
                // Leave the checkpoint where it is so the whole batch is
                // retried; merges are idempotent.
                warn!(
                    checkpoint = from,
                    uuid = %row.uuid,
                    ip = %row.ip,
                    "Relay publish failed, retrying batch next tick"
                );
                stats.errors += 1;
                break 'drain;
            }
        }

        checkpoint.store(batch.checkpoint, Ordering::Release);
        metrics::set_sync_checkpoint(batch.checkpoint);

        if batch.checkpoint == from || batch.len() < fetch_batch_size {
            break;
        }
    }

    let cutoff = now_millis() - config.queue_retention_duration().as_millis() as i64;
    match store.prune_queue(cutoff).await {
        Ok(pruned) => {
            stats.pruned = pruned;
            if pruned > 0 {
                metrics::record_queue_pruned(pruned);
                debug!(pruned, "Pruned queue");
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to prune queue");
            stats.errors += 1;
        }
    }

    stats
}

fn relays_reconciliation(kind: TransportKind) -> bool {
    kind.relays_reconciliation()
}
