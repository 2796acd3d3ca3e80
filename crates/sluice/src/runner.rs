//! Consumer loop
//!
//! Drives any [`BatchSource`]: poll, write to the sink, acknowledge. A batch
//! is acknowledged only after the sink accepted it, so a crash between the
//! two replays the batch on the next start.

use crate::config::RunSettings;
use crate::sink::JsonLinesSink;
use anyhow::{Context, Result};
use sluice_core::BatchSource;
use std::io::Write;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What one run consumed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub records: u64,
    pub errors: u64,
    pub post_process_failures: u64,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Idle,
    BatchLimit,
}

/// Run `source` into `sink` until shutdown, idleness or the batch limit.
///
/// The source is always stopped before returning, also when the loop failed.
pub async fn run_source<S, W>(
    source: &mut S,
    sink: &mut JsonLinesSink<W>,
    settings: &RunSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<RunSummary>
where
    S: BatchSource,
    W: Write,
{
    source.start().await.context("Failed to start source")?;
    info!("Source started");

    let mut summary = RunSummary::default();
    let result = consume(source, sink, settings, &mut shutdown, &mut summary).await;

    if let Err(e) = source.stop().await {
        warn!("Failed to stop source cleanly: {}", e);
    }

    match result {
        Ok(exit) => {
            info!(
                "Source stopped ({:?}): {} batches, {} records, {} errors",
                exit, summary.batches, summary.records, summary.errors
            );
            Ok(summary)
        }
        Err(e) => {
            error!("Source failed after {} batches: {:#}", summary.batches, e);
            Err(e)
        }
    }
}

async fn consume<S, W>(
    source: &mut S,
    sink: &mut JsonLinesSink<W>,
    settings: &RunSettings,
    shutdown: &mut watch::Receiver<bool>,
    summary: &mut RunSummary,
) -> Result<Exit>
where
    S: BatchSource,
    W: Write,
{
    loop {
        if *shutdown.borrow() {
            return Ok(Exit::Shutdown);
        }
        if settings
            .max_batches
            .is_some_and(|limit| summary.batches >= limit)
        {
            return Ok(Exit::BatchLimit);
        }

        let polled = tokio::select! {
            polled = source.poll_next_batch(settings.poll_timeout()) => polled,
            _ = shutdown.changed() => return Ok(Exit::Shutdown),
        };

        let Some(batch) = polled.context("Source failed")? else {
            if settings.stop_when_idle {
                return Ok(Exit::Idle);
            }
            continue;
        };

        let lines = sink
            .write_batch(&batch)
            .with_context(|| format!("Failed to write {}", batch.id))?;
        debug!(
            "Wrote {} ({} records, {} errors, {} lines)",
            batch.id,
            batch.records.len(),
            batch.errors.len(),
            lines
        );

        let report = source
            .acknowledge(batch.id)
            .await
            .with_context(|| format!("Failed to acknowledge {}", batch.id))?;
        for failure in &report.failures {
            warn!("{}: {}", batch.id, failure);
        }

        summary.batches += 1;
        summary.records += batch.records.len() as u64;
        summary.errors += batch.errors.len() as u64;
        summary.post_process_failures += report.failures.len() as u64;

        if batch.is_empty() && settings.stop_when_idle {
            return Ok(Exit::Idle);
        }
    }
}
