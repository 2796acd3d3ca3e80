//! # Batch hand-off
//!
//! Batches travel from an engine to the downstream consumer through a bounded
//! channel. The channel depth is the unit of backpressure: with a depth of one
//! the engine can assemble at most one batch ahead of the consumer.
//!
//! Every batch is sent together with an engine-defined *commit context* (the
//! cursor position it represents, the files it finished, ...). The receiver
//! keeps the context until the consumer acknowledges the batch, then returns
//! it to the engine so the cursor can be persisted.
//!
//! ```rust
//! # async fn example() -> sluice_core::Result<()> {
//! use sluice_core::{batch, Batch, CoreError};
//! use std::time::Duration;
//!
//! let (tx, mut rx) = batch::channel::<u64, CoreError>(1);
//! tx.send(Batch::new(tx.next_batch_id()), 42).await?;
//!
//! let delivered = rx.poll_next_batch(Duration::from_millis(100)).await?.unwrap();
//! assert_eq!(rx.take_commit(delivered.id)?, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{CoreError, Result};
use crate::record::Record;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier of a delivered batch, unique per source instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(u64);

impl BatchId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// A record that could not be decoded or delivered, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub record: Record,
    pub error_code: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(record: Record, error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            record,
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

/// The atomic unit of delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    /// Good records, in source order
    pub records: Vec<Record>,
    /// Side channel for records that failed; never counted against the batch size
    pub errors: Vec<ErrorRecord>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: BatchId) -> Self {
        Self {
            id,
            records: Vec::new(),
            errors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Number of good records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the batch has neither records nor errors.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Outcome of acknowledging a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckReport {
    pub batch_id: Option<BatchId>,
    pub records: usize,
    /// Non-fatal failures raised while committing (e.g. post-processing)
    pub failures: Vec<String>,
}

impl AckReport {
    pub fn new(batch_id: BatchId, records: usize) -> Self {
        Self {
            batch_id: Some(batch_id),
            records,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Handoff<C, E> {
    Batch { batch: Batch, commit: C },
    Failed(E),
}

/// Create a bounded batch channel of the given depth (at least 1).
pub fn channel<C, E>(depth: usize) -> (BatchSender<C, E>, BatchReceiver<C, E>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        BatchSender {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        BatchReceiver {
            rx,
            in_flight: HashMap::new(),
        },
    )
}

/// Producing half. Cheap to clone; all clones share the id sequence.
pub struct BatchSender<C, E> {
    tx: mpsc::Sender<Handoff<C, E>>,
    next_id: Arc<AtomicU64>,
}

impl<C, E> Clone for BatchSender<C, E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<C, E> BatchSender<C, E> {
    /// Allocate the id for the next batch.
    pub fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a batch, waiting while the queue is full.
    pub async fn send(&self, batch: Batch, commit: C) -> Result<()> {
        self.tx
            .send(Handoff::Batch { batch, commit })
            .await
            .map_err(|_| CoreError::QueueClosed)
    }

    /// Blocking variant of [`send`](Self::send) for worker threads.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_send(&self, batch: Batch, commit: C) -> Result<()> {
        self.tx
            .blocking_send(Handoff::Batch { batch, commit })
            .map_err(|_| CoreError::QueueClosed)
    }

    /// Report a fatal engine error; the consumer sees it on its next poll.
    pub async fn fail(&self, error: E) {
        let _ = self.tx.send(Handoff::Failed(error)).await;
    }

    /// Blocking variant of [`fail`](Self::fail).
    pub fn blocking_fail(&self, error: E) {
        let _ = self.tx.blocking_send(Handoff::Failed(error));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consuming half. Tracks delivered-but-unacknowledged batches.
pub struct BatchReceiver<C, E> {
    rx: mpsc::Receiver<Handoff<C, E>>,
    in_flight: HashMap<BatchId, C>,
}

impl<C, E: From<CoreError>> BatchReceiver<C, E> {
    /// Wait up to `max_wait` for the next batch.
    ///
    /// Returns `Ok(None)` on timeout and the engine's error if it failed.
    pub async fn poll_next_batch(&mut self, max_wait: Duration) -> std::result::Result<Option<Batch>, E> {
        match tokio::time::timeout(max_wait, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(CoreError::QueueClosed.into()),
            Ok(Some(Handoff::Failed(e))) => Err(e),
            Ok(Some(Handoff::Batch { batch, commit })) => {
                debug!(
                    "Delivering {} ({} records, {} errors)",
                    batch.id,
                    batch.records.len(),
                    batch.errors.len()
                );
                self.in_flight.insert(batch.id, commit);
                Ok(Some(batch))
            }
        }
    }
}

impl<C, E> BatchReceiver<C, E> {
    /// Remove and return the commit context of a delivered batch.
    pub fn take_commit(&mut self, id: BatchId) -> Result<C> {
        self.in_flight
            .remove(&id)
            .ok_or(CoreError::UnknownBatch(id))
    }

    /// Number of delivered batches awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop accepting batches; queued but undelivered batches are dropped.
    pub fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}
