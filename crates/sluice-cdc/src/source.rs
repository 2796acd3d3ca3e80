//! CDC source engine
//!
//! [`CdcSource`] runs one reader task per started source. The task tails the
//! transaction log, feeds the [`Reconstructor`] and cuts batches of committed
//! changes:
//!
//! - a batch is sent once it holds `max_batch_size_in_records` events, or
//!   when `batch_wait_time` passed since its first item arrived;
//! - empty batches are never sent;
//! - malformed log records and overflow notices travel in the error channel.
//!
//! Every `session_window` of log time the reader reopens its cursor at the
//! next position. Reopening re-checks retention, so a purged log surfaces as
//! a fatal error instead of a silent gap.
//!
//! Acknowledging a batch persists a [`CdcPosition`]: the restart position
//! (the oldest record still needed) and the key of the newest delivered item.
//! On restart the log is re-read from the restart position and items already
//! delivered are skipped.

use crate::config::{CdcConfig, LogSourceConfig};
use crate::error::{CdcError, Result};
use crate::event::{EventKey, HEADER_POSITION};
use crate::filter::TableFilter;
use crate::log::{DirectoryLog, LogCursor, LogStart, TransactionLog};
use crate::reconstructor::{
    CdcPosition, CdcStats, Emitted, Reconstructor, ReconstructorOptions,
};
use crate::spill::SpillStore;
use crate::transaction::TransactionArena;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    batch, AckReport, Batch, BatchId, BatchReceiver, BatchSender, BatchSource, ErrorRecord,
    Field, FileOffsetStore, MemoryOffsetStore, Offset, OffsetStore, Record,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commit context of a delivered batch
#[derive(Debug, Clone)]
pub struct CdcCommit {
    pub records: usize,
    pub errors: usize,
    pub position: CdcPosition,
}

struct Running {
    receiver: BatchReceiver<CdcCommit, CdcError>,
    position: CdcPosition,
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

/// Change-data-capture source over a transaction log.
pub struct CdcSource {
    name: String,
    config: CdcConfig,
    log: Option<Arc<dyn TransactionLog>>,
    store: Option<Arc<dyn OffsetStore>>,
    running: Option<Running>,
    stats: Arc<CdcStats>,
    healthy: Arc<AtomicBool>,
}

impl CdcSource {
    /// Create a source. `name` keys the persisted position.
    pub fn new(name: impl Into<String>, config: CdcConfig) -> Self {
        Self {
            name: name.into(),
            config,
            log: None,
            store: None,
            running: None,
            stats: Arc::new(CdcStats::default()),
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read from an explicit log instead of the one named in the config.
    pub fn with_log(mut self, log: Arc<dyn TransactionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Use an explicit offset store instead of the one derived from the config.
    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<CdcStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Last acknowledged position, or the stored one when not running.
    pub async fn position(&mut self) -> Result<Option<CdcPosition>> {
        if let Some(running) = &self.running {
            return Ok(Some(running.position.clone()));
        }
        self.load_position().await
    }

    /// Forget the stored position; the next start uses `start_position` again.
    pub async fn reset(&mut self) -> Result<()> {
        if self.running.is_some() {
            warn!(
                "Resetting '{}' while running; takes effect on the next start",
                self.name
            );
        }
        self.offset_store().await?.delete(&self.name).await?;
        info!("Reset CDC position of '{}'", self.name);
        Ok(())
    }

    fn transaction_log(&self) -> Arc<dyn TransactionLog> {
        if let Some(log) = &self.log {
            return Arc::clone(log);
        }
        match &self.config.log {
            LogSourceConfig::Directory { path } => Arc::new(DirectoryLog::new(path)),
        }
    }

    async fn offset_store(&mut self) -> Result<Arc<dyn OffsetStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let store: Arc<dyn OffsetStore> = match &self.config.offset_directory {
            Some(dir) => Arc::new(FileOffsetStore::new(dir).await?),
            None => Arc::new(MemoryOffsetStore::new()),
        };
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn load_position(&mut self) -> Result<Option<CdcPosition>> {
        let store = self.offset_store().await?;
        match store.load(&self.name).await? {
            Some(offset) => Ok(Some(offset.position_as()?)),
            None => Ok(None),
        }
    }

    fn running(&mut self) -> Result<&mut Running> {
        self.running
            .as_mut()
            .ok_or_else(|| CdcError::invalid_state(format!("source '{}' is not running", self.name)))
    }
}

#[async_trait]
impl BatchSource for CdcSource {
    type Error = CdcError;

    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(CdcError::invalid_state(format!(
                "source '{}' is already running",
                self.name
            )));
        }
        self.config.check()?;
        let filter = TableFilter::new(&self.config.tables)?;
        let log = self.transaction_log();
        let store = self.offset_store().await?;

        let resume = self.load_position().await?;
        let start = match &resume {
            Some(position) => {
                info!(
                    "Resuming '{}' at log position {} (last delivered {:?})",
                    self.name, position.restart_position, position.last_delivered
                );
                LogStart::Position(position.restart_position)
            }
            None => LogStart::from_config(&self.config.start_position)?,
        };
        let cursor = log.open(start).await?;

        // First start: pin the initial position so a restart does not move it.
        let position = match resume.clone() {
            Some(position) => position,
            None => {
                let initial = CdcPosition {
                    restart_position: cursor.next_position(),
                    ..CdcPosition::default()
                };
                store.save(&Offset::new(&self.name, &initial)?).await?;
                initial
            }
        };

        let arena = if self.config.buffer_locally {
            TransactionArena::in_memory()
        } else {
            TransactionArena::spilling(SpillStore::new(self.config.resolved_spill_directory())?)
        };
        let reconstructor = Reconstructor::new(
            ReconstructorOptions::from_config(&self.config)?,
            filter,
            arena,
            cursor.next_position(),
            resume.as_ref(),
            Arc::clone(&self.stats),
        );

        let (sender, receiver) = batch::channel(self.config.max_pending_batches);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = Reader {
            name: self.name.clone(),
            log,
            cursor,
            reconstructor,
            sender,
            shutdown: shutdown_rx,
            batch_size: self.config.max_batch_size_in_records,
            batch_wait_time: self.config.batch_wait_time(),
            poll_interval: self.config.poll_interval(),
            session_window: self.config.session_duration()?,
            delivered: position.last_delivered,
            stats: Arc::clone(&self.stats),
            healthy: Arc::clone(&self.healthy),
        };

        self.healthy.store(true, Ordering::SeqCst);
        self.running = Some(Running {
            receiver,
            position,
            shutdown,
            reader: tokio::spawn(reader.run()),
        });
        info!("CDC source '{}' started", self.name);
        Ok(())
    }

    async fn poll_next_batch(&mut self, max_wait: Duration) -> Result<Option<Batch>> {
        let healthy = Arc::clone(&self.healthy);
        let running = self.running()?;
        match running.receiver.poll_next_batch(max_wait).await {
            Ok(batch) => Ok(batch),
            Err(e) => {
                if e.is_fatal() {
                    healthy.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    async fn acknowledge(&mut self, batch_id: BatchId) -> Result<AckReport> {
        let name = self.name.clone();
        let store = self.offset_store().await?;
        let running = self.running()?;
        let commit = running.receiver.take_commit(batch_id)?;

        let position = running.position.advance(&commit.position);
        store.save(&Offset::new(name, &position)?).await?;
        running.position = position;
        debug!(
            "Acknowledged {} ({} events, {} errors, restart at {})",
            batch_id, commit.records, commit.errors, running.position.restart_position
        );
        Ok(AckReport::new(batch_id, commit.records))
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        running.receiver.close();

        let grace = self.config.stop_grace_period();
        if tokio::time::timeout(grace, &mut running.reader).await.is_err() {
            warn!(
                "Log reader of '{}' did not stop within {:?}, aborting",
                self.name, grace
            );
            running.reader.abort();
        }
        self.healthy.store(false, Ordering::SeqCst);
        info!("CDC source '{}' stopped", self.name);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.is_some() && self.healthy.load(Ordering::SeqCst)
    }
}

/// Items collected for the next batch
#[derive(Default)]
struct PendingBatch {
    records: Vec<Record>,
    errors: Vec<ErrorRecord>,
    last_key: Option<EventKey>,
    first_at: Option<Instant>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }

    fn touch(&mut self) {
        self.first_at.get_or_insert_with(Instant::now);
    }
}

struct Reader {
    name: String,
    log: Arc<dyn TransactionLog>,
    cursor: Box<dyn LogCursor>,
    reconstructor: Reconstructor,
    sender: BatchSender<CdcCommit, CdcError>,
    shutdown: watch::Receiver<bool>,
    batch_size: usize,
    batch_wait_time: Duration,
    poll_interval: Duration,
    session_window: chrono::Duration,
    delivered: Option<EventKey>,
    stats: Arc<CdcStats>,
    healthy: Arc<AtomicBool>,
}

impl Reader {
    async fn run(mut self) {
        debug!("Log reader of '{}' started", self.name);
        match self.work().await {
            Ok(()) => debug!("Log reader of '{}' stopped", self.name),
            Err(e) if self.stopping() => debug!("Log reader of '{}' stopped: {}", self.name, e),
            Err(e) => {
                error!("Log reader of '{}' failed: {}", self.name, e);
                if e.is_fatal() {
                    self.healthy.store(false, Ordering::SeqCst);
                }
                self.sender.fail(e).await;
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.sender.is_closed()
    }

    async fn work(&mut self) -> Result<()> {
        let mut pending = PendingBatch::default();
        let mut session_start: Option<DateTime<Utc>> = None;

        while !self.stopping() {
            while pending.records.len() < self.batch_size {
                let Some(item) = self.reconstructor.pop() else {
                    break;
                };
                pending.touch();
                pending.last_key = Some(item.key());
                match item {
                    Emitted::Change(event) => pending.records.push(event.to_record()),
                    Emitted::Overflow { error, .. } => pending.errors.push(error),
                }
            }
            if pending.records.len() >= self.batch_size || self.wait_elapsed(&pending) {
                self.deliver(&mut pending).await?;
                continue;
            }

            match self.cursor.next_record().await {
                Ok(Some(record)) => {
                    self.reconstructor.apply(&record)?;
                    let started = *session_start.get_or_insert(record.timestamp);
                    if record.timestamp - started >= self.session_window {
                        self.new_session().await?;
                        session_start = Some(record.timestamp);
                    }
                }
                Ok(None) => {
                    if self.reconstructor.ready_len() == 0 {
                        self.idle(&pending).await;
                    }
                }
                Err(CdcError::Decode { position, message }) => {
                    warn!("Skipping malformed log record at {}: {}", position, message);
                    self.stats.record_decode_error();
                    pending.touch();
                    pending.errors.push(decode_error(position, message));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn wait_elapsed(&self, pending: &PendingBatch) -> bool {
        !pending.is_empty()
            && pending
                .first_at
                .is_some_and(|first| first.elapsed() >= self.batch_wait_time)
    }

    /// Sleep until more log might be available, the pending batch is due, or
    /// shutdown.
    async fn idle(&mut self, pending: &PendingBatch) {
        let mut nap = self.poll_interval;
        if let Some(first) = pending.first_at {
            nap = nap.min(self.batch_wait_time.saturating_sub(first.elapsed()));
        }
        tokio::select! {
            _ = tokio::time::sleep(nap) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn new_session(&mut self) -> Result<()> {
        let next = self.cursor.next_position();
        self.cursor = self.log.open(LogStart::Position(next)).await?;
        self.stats.record_session();
        debug!("Log reader of '{}' started a new session at {}", self.name, next);
        Ok(())
    }

    async fn deliver(&mut self, pending: &mut PendingBatch) -> Result<()> {
        let taken = std::mem::take(pending);
        if let Some(key) = taken.last_key {
            self.delivered = Some(key);
        }
        let commit = CdcCommit {
            records: taken.records.len(),
            errors: taken.errors.len(),
            position: self.reconstructor.checkpoint(self.delivered),
        };
        let mut batch = Batch::new(self.sender.next_batch_id());
        batch.records = taken.records;
        batch.errors = taken.errors;
        debug!(
            "Sending {} with {} events and {} errors",
            batch.id,
            batch.records.len(),
            batch.errors.len()
        );
        self.stats.record_batch();
        self.sender.send(batch, commit).await?;
        Ok(())
    }
}

fn decode_error(position: u64, message: String) -> ErrorRecord {
    let record = Record::new(
        format!("position::{position}"),
        Field::map_from([("position", Field::long(position as i64))]),
    )
    .with_header(HEADER_POSITION, position.to_string());
    let err = CdcError::decode(position, message);
    ErrorRecord::new(record, err.error_code(), err.to_string())
}
