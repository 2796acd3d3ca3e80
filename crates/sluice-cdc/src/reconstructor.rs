//! Transaction reconstruction
//!
//! The [`Reconstructor`] consumes log records in position order and turns
//! them into committed row changes:
//!
//! - DML on captured tables is buffered per transaction until the
//!   transaction ends. Rolled-back work never leaves the buffer.
//! - A COMMIT resolves the transaction and its changes become deliverable in
//!   commit order.
//! - A transaction that stays open longer than `max_transaction_length` (log
//!   time) or buffers more than `max_transaction_events` changes overflows.
//!   It is discarded or flushed according to the [`OverflowPolicy`], and an
//!   overflow notice goes to the error channel either way.
//!
//! With strict low-water emission, a resolved transaction is held back until
//! no transaction that started before its commit is still open. Delivery then
//! never overtakes a transaction that could still commit earlier work.
//!
//! Every deliverable item carries an [`EventKey`]. Keys increase in delivery
//! order, so after a restart anything at or below the last acknowledged key is
//! skipped and nothing is delivered twice.

use crate::config::{CdcConfig, OverflowPolicy};
use crate::error::{CdcError, Result};
use crate::event::{ChangeEvent, EventKey, LogOp, LogRecord, HEADER_POSITION, HEADER_TXN_ID};
use crate::filter::TableFilter;
use crate::transaction::{PendingChange, ResolvedTransaction, TransactionArena};
use serde::{Deserialize, Serialize};
use sluice_core::{ErrorRecord, Field, Record};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Atomic counters for a CDC source
#[derive(Debug, Default)]
pub struct CdcStats {
    log_records: AtomicU64,
    events: AtomicU64,
    duplicates_skipped: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    overflows: AtomicU64,
    decode_errors: AtomicU64,
    batches: AtomicU64,
    sessions: AtomicU64,
    open_transactions: AtomicU64,
}

impl CdcStats {
    pub fn record_log_record(&self) {
        self.log_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events(&self, count: usize) {
        self.events.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_duplicates(&self, count: usize) {
        self.duplicates_skipped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_open_transactions(&self, count: usize) {
        self.open_transactions.store(count as u64, Ordering::Relaxed);
    }

    pub fn log_records(&self) -> u64 {
        self.log_records.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn duplicates_skipped(&self) -> u64 {
        self.duplicates_skipped.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn open_transactions(&self) -> u64 {
        self.open_transactions.load(Ordering::Relaxed)
    }
}

/// A transaction dropped by an overflow DISCARD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedTxn {
    pub start_position: u64,
    /// Position of its COMMIT or ROLLBACK, once seen
    pub end_position: Option<u64>,
}

/// A transaction delivered in full whose records lie partly before the
/// restart position. A restart must skip its remaining records instead of
/// rebuilding it from the middle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTxn {
    pub txn_id: String,
    pub start_position: u64,
    /// Position of the COMMIT, or of the record that forced it out
    pub resolved_at: u64,
}

impl ResolvedTxn {
    fn covers(&self, record: &LogRecord) -> bool {
        self.txn_id == record.txn_id
            && (self.start_position..=self.resolved_at).contains(&record.position)
    }
}

/// Persisted CDC cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CdcPosition {
    /// Log position reading resumes from
    pub restart_position: u64,
    /// Key of the newest acknowledged item
    #[serde(default)]
    pub last_delivered: Option<EventKey>,
    /// Discarded transactions whose remaining records must stay ignored
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub discarded: BTreeMap<String, DiscardedTxn>,
    /// Delivered transactions that started before `restart_position`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved: Vec<ResolvedTxn>,
}

impl CdcPosition {
    /// Position to persist after acknowledging a batch cut at `newer`.
    pub fn advance(&self, newer: &CdcPosition) -> CdcPosition {
        CdcPosition {
            restart_position: self.restart_position.max(newer.restart_position),
            last_delivered: self.last_delivered.max(newer.last_delivered),
            discarded: newer.discarded.clone(),
            resolved: newer.resolved.clone(),
        }
    }
}

/// A deliverable item.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    Change(ChangeEvent),
    /// Overflow notice for the error channel
    Overflow { key: EventKey, error: ErrorRecord },
}

impl Emitted {
    pub fn key(&self) -> EventKey {
        match self {
            Self::Change(event) => event.key,
            Self::Overflow { key, .. } => *key,
        }
    }
}

/// Reconstruction settings
#[derive(Debug, Clone)]
pub struct ReconstructorOptions {
    pub strict_low_water_emission: bool,
    pub max_transaction_length: chrono::Duration,
    pub max_transaction_events: usize,
    pub overflow_policy: OverflowPolicy,
}

impl ReconstructorOptions {
    pub fn from_config(config: &CdcConfig) -> Result<Self> {
        Ok(Self {
            strict_low_water_emission: config.strict_low_water_emission,
            max_transaction_length: config.max_transaction_duration()?,
            max_transaction_events: config.max_transaction_events,
            overflow_policy: config.overflow_policy,
        })
    }
}

/// Items resolved by one log record, held for strict emission
#[derive(Debug)]
struct Held {
    commit_position: u64,
    items: Vec<Emitted>,
}

/// Log records in, committed changes out.
#[derive(Debug)]
pub struct Reconstructor {
    options: ReconstructorOptions,
    filter: TableFilter,
    arena: TransactionArena,
    held: VecDeque<Held>,
    ready: VecDeque<Emitted>,
    discarded: BTreeMap<String, DiscardedTxn>,
    resolved: Vec<ResolvedTxn>,
    /// Items at or below this key were delivered before a restart
    delivered: Option<EventKey>,
    next_position: u64,
    stats: Arc<CdcStats>,
}

impl Reconstructor {
    /// `next_position` is where the log cursor starts; `resume` is the
    /// restored cursor, if any.
    pub fn new(
        options: ReconstructorOptions,
        filter: TableFilter,
        arena: TransactionArena,
        next_position: u64,
        resume: Option<&CdcPosition>,
        stats: Arc<CdcStats>,
    ) -> Self {
        Self {
            options,
            filter,
            arena,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            discarded: resume.map(|p| p.discarded.clone()).unwrap_or_default(),
            resolved: resume.map(|p| p.resolved.clone()).unwrap_or_default(),
            delivered: resume.and_then(|p| p.last_delivered),
            next_position,
            stats,
        }
    }

    /// Process the next log record.
    pub fn apply(&mut self, record: &LogRecord) -> Result<()> {
        self.stats.record_log_record();
        self.next_position = self.next_position.max(record.position + 1);

        let mut resolved = Vec::new();
        if !self.is_replayed(record) && !self.is_discarded(record) {
            self.apply_op(record, &mut resolved)?;
        }
        for txn_id in self
            .arena
            .expired(record.timestamp, self.options.max_transaction_length)
        {
            let reason = format!(
                "open longer than {}s",
                self.options.max_transaction_length.num_seconds()
            );
            self.overflow(&txn_id, record, reason, &mut resolved)?;
        }

        self.enqueue(record.position, resolved);
        self.release_held();
        self.stats.set_open_transactions(self.arena.open_count());
        Ok(())
    }

    fn apply_op(&mut self, record: &LogRecord, resolved: &mut Vec<Emitted>) -> Result<()> {
        match &record.op {
            LogOp::Dml(dml) => {
                if !self.filter.matches(&dml.schema, &dml.table) {
                    return Ok(());
                }
                let mut pending = 0;
                for image in dml.row_images() {
                    pending = self.arena.record_change(
                        record,
                        PendingChange {
                            schema: dml.schema.clone(),
                            table: dml.table.clone(),
                            operation: dml.op,
                            columns: image.to_vec(),
                            position: record.position,
                        },
                    )?;
                }
                if pending > self.options.max_transaction_events {
                    let reason = format!(
                        "more than {} pending events",
                        self.options.max_transaction_events
                    );
                    self.overflow(&record.txn_id, record, reason, resolved)?;
                }
            }
            LogOp::Savepoint { name } => self.arena.savepoint(record, name)?,
            LogOp::RollbackTo { name } => {
                if !self.arena.rollback_to(&record.txn_id, name)? {
                    warn!(
                        "Rollback to unknown savepoint '{}' in transaction {} at position {}",
                        name, record.txn_id, record.position
                    );
                }
            }
            LogOp::Commit => match self.arena.commit(record)? {
                Some(txn) => {
                    self.stats.record_commit();
                    debug!(
                        "Transaction {} committed at {} with {} change(s)",
                        txn.id,
                        txn.commit_position,
                        txn.changes.len()
                    );
                    self.note_resolved(&txn);
                    resolved.extend(materialize(txn));
                }
                None => debug!("Commit of untracked transaction {}", record.txn_id),
            },
            LogOp::Rollback => {
                if let Some(dropped) = self.arena.rollback(&record.txn_id) {
                    self.stats.record_rollback();
                    debug!(
                        "Transaction {} rolled back, {} change(s) dropped",
                        record.txn_id, dropped
                    );
                }
            }
        }
        Ok(())
    }

    /// True when the record belongs to a transaction delivered before a
    /// restart. Live records always lie past every recorded resolution.
    fn is_replayed(&self, record: &LogRecord) -> bool {
        self.resolved.iter().any(|txn| txn.covers(record))
    }

    fn note_resolved(&mut self, txn: &ResolvedTransaction) {
        self.resolved.push(ResolvedTxn {
            txn_id: txn.id.clone(),
            start_position: txn.start_position,
            resolved_at: txn.commit_position,
        });
    }

    /// True when the record belongs to a discarded transaction.
    fn is_discarded(&mut self, record: &LogRecord) -> bool {
        let Some(entry) = self.discarded.get_mut(&record.txn_id) else {
            return false;
        };
        match entry.end_position {
            Some(end) if record.position > end => {
                // id reused by a later transaction
                self.discarded.remove(&record.txn_id);
                false
            }
            Some(_) => true,
            None => {
                if matches!(record.op, LogOp::Commit | LogOp::Rollback) {
                    entry.end_position = Some(record.position);
                }
                true
            }
        }
    }

    fn overflow(
        &mut self,
        txn_id: &str,
        at: &LogRecord,
        reason: String,
        resolved: &mut Vec<Emitted>,
    ) -> Result<()> {
        let Some(txn) = self.arena.get(txn_id) else {
            return Ok(());
        };
        let start_position = txn.start_position;
        let pending = txn.len();
        let started_at = txn.started_at;
        let err = CdcError::overflow(txn_id, reason);
        warn!(
            "{} at log position {} ({} pending, policy {:?})",
            err, at.position, pending, self.options.overflow_policy
        );
        self.stats.record_overflow();

        let mut notice = Record::new(
            format!("{}::{}::overflow", txn_id, at.position),
            Field::map_from([
                ("txn_id", Field::string(txn_id)),
                ("pending_events", Field::long(pending as i64)),
                ("started_at", Field::string(started_at.to_rfc3339())),
                ("start_position", Field::long(start_position as i64)),
            ]),
        );
        notice.header.set(HEADER_TXN_ID, txn_id);
        notice.header.set(HEADER_POSITION, at.position.to_string());
        resolved.push(Emitted::Overflow {
            key: EventKey {
                commit_position: at.position,
                txn_start_position: start_position,
                sequence: 0,
            },
            error: ErrorRecord::new(notice, err.error_code(), err.to_string()),
        });

        match self.options.overflow_policy {
            OverflowPolicy::Flush => {
                if let Some(txn) = self.arena.force_resolve(txn_id, at, true)? {
                    self.note_resolved(&txn);
                    resolved.extend(materialize(txn));
                }
            }
            OverflowPolicy::Discard => {
                self.arena.force_resolve(txn_id, at, false)?;
                self.discarded.insert(
                    txn_id.to_string(),
                    DiscardedTxn {
                        start_position,
                        end_position: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, commit_position: u64, mut items: Vec<Emitted>) {
        let before = items.len();
        if let Some(delivered) = self.delivered {
            items.retain(|item| item.key() > delivered);
        }
        if items.len() < before {
            self.stats.record_duplicates(before - items.len());
        }
        if items.is_empty() {
            return;
        }
        items.sort_by_key(Emitted::key);
        if self.options.strict_low_water_emission {
            self.held.push_back(Held {
                commit_position,
                items,
            });
        } else {
            self.ready.extend(items);
        }
    }

    fn release_held(&mut self) {
        while self
            .held
            .front()
            .is_some_and(|held| !self.arena.has_open_before(held.commit_position))
        {
            if let Some(held) = self.held.pop_front() {
                self.ready.extend(held.items);
            }
        }
    }

    /// Next deliverable item.
    pub fn pop(&mut self) -> Option<Emitted> {
        let item = self.ready.pop_front();
        if let Some(Emitted::Change(_)) = &item {
            self.stats.record_events(1);
        }
        item
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Resolved items waiting for older transactions.
    pub fn held_len(&self) -> usize {
        self.held.iter().map(|h| h.items.len()).sum()
    }

    pub fn open_transactions(&self) -> usize {
        self.arena.open_count()
    }

    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    /// Earliest log position that must be re-read to rebuild every open
    /// transaction and every undelivered item.
    pub fn restart_position(&self) -> u64 {
        let undelivered = self
            .held
            .iter()
            .flat_map(|h| h.items.iter())
            .chain(self.ready.iter())
            .map(|item| item.key().txn_start_position);
        self.arena
            .oldest_start_position()
            .into_iter()
            .chain(undelivered)
            .fold(self.next_position, u64::min)
    }

    /// Cursor to persist once everything up to `last_delivered` is acknowledged.
    pub fn checkpoint(&mut self, last_delivered: Option<EventKey>) -> CdcPosition {
        let restart = self.restart_position();
        self.discarded
            .retain(|_, d| d.end_position.map_or(true, |end| end >= restart));
        // Anything that started before `restart` was fully popped already,
        // otherwise its items would hold the restart position down.
        self.resolved.retain(|txn| txn.resolved_at >= restart);
        CdcPosition {
            restart_position: restart,
            last_delivered,
            discarded: self
                .discarded
                .iter()
                .filter(|(_, d)| d.start_position < restart)
                .map(|(id, d)| (id.clone(), *d))
                .collect(),
            resolved: self
                .resolved
                .iter()
                .filter(|txn| txn.start_position < restart)
                .cloned()
                .collect(),
        }
    }
}

fn materialize(txn: ResolvedTransaction) -> Vec<Emitted> {
    let ResolvedTransaction {
        id,
        start_position,
        commit_position,
        commit_timestamp,
        changes,
        forced,
    } = txn;
    changes
        .into_iter()
        .enumerate()
        .map(|(index, change)| {
            Emitted::Change(ChangeEvent {
                schema: change.schema,
                table: change.table,
                operation: change.operation,
                columns: change.columns,
                txn_id: id.clone(),
                commit_timestamp,
                key: EventKey {
                    commit_position,
                    txn_start_position: start_position,
                    sequence: index as u64 + 1,
                },
                log_position: change.position,
                forced,
            })
        })
        .collect()
}
