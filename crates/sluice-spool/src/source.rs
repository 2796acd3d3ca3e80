//! Directory source engine
//!
//! [`DirectorySource`] ties the pieces together:
//!
//! 1. `start` validates the configuration, restores the [`SpoolPosition`]
//!    from the offset store and spawns `number_of_threads` blocking reader
//!    workers (plus the archive reaper when retention is configured).
//! 2. Workers rescan the directory whenever the spool runs dry, claim files in
//!    read order, assemble batches and hand them to the bounded queue. A full
//!    queue blocks the workers, which is the only backpressure there is.
//! 3. `acknowledge` post-processes the files finished by the batch and then
//!    persists the position, before it returns.
//!
//! With a single worker a batch may span files. With several workers each
//! worker owns whole files and a batch never spans two of them.

use crate::assembler::{Assembled, BatchAssembler, FileOutcome, SpoolCommit};
use crate::config::{PostProcessing, SpoolConfig};
use crate::cursor::FileCursor;
use crate::error::{Result, SpoolError};
use crate::format::{FormatError, FormatPlan};
use crate::post_process::{ArchiveReaper, PostProcessor};
use crate::scanner::DirectoryScanner;
use crate::spool::{Spool, SpoolPosition};
use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{
    batch, AckReport, Batch, BatchId, BatchReceiver, BatchSender, BatchSource, CoreError,
    FileOffsetStore, MemoryOffsetStore, Offset, OffsetStore,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const IDLE_SLICE: Duration = Duration::from_millis(50);

/// Atomic counters for a directory source
#[derive(Debug, Default)]
pub struct SpoolStats {
    files_started: AtomicU64,
    files_completed: AtomicU64,
    files_failed: AtomicU64,
    records: AtomicU64,
    errors: AtomicU64,
    batches: AtomicU64,
    post_process_failures: AtomicU64,
}

impl SpoolStats {
    pub fn record_file_started(&self) {
        self.files_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, records: usize, errors: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records as u64, Ordering::Relaxed);
        self.errors.fetch_add(errors as u64, Ordering::Relaxed);
    }

    pub fn record_post_process_failure(&self) {
        self.post_process_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_started(&self) -> u64 {
        self.files_started.load(Ordering::Relaxed)
    }

    pub fn files_completed(&self) -> u64 {
        self.files_completed.load(Ordering::Relaxed)
    }

    pub fn files_failed(&self) -> u64 {
        self.files_failed.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn post_process_failures(&self) -> u64 {
        self.post_process_failures.load(Ordering::Relaxed)
    }
}

struct Running {
    receiver: BatchReceiver<SpoolCommit, SpoolError>,
    spool: Arc<Mutex<Spool>>,
    post: PostProcessor,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

/// Spooling source over one directory tree.
pub struct DirectorySource {
    name: String,
    config: SpoolConfig,
    store: Option<Arc<dyn OffsetStore>>,
    running: Option<Running>,
    stats: Arc<SpoolStats>,
    healthy: Arc<AtomicBool>,
}

impl DirectorySource {
    /// Create a source. `name` keys the persisted position.
    pub fn new(name: impl Into<String>, config: SpoolConfig) -> Self {
        Self {
            name: name.into(),
            config,
            store: None,
            running: None,
            stats: Arc::new(SpoolStats::default()),
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use an explicit offset store instead of the one derived from the config.
    pub fn with_offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<SpoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Current spool position (acknowledged state only).
    pub async fn position(&mut self) -> Result<SpoolPosition> {
        if let Some(running) = &self.running {
            return Ok(running.spool.lock().position().clone());
        }
        self.load_position().await
    }

    /// Forget what was consumed so the directory is read from scratch.
    ///
    /// Files already archived or deleted are gone and are not replayed.
    pub async fn reset(&mut self) -> Result<()> {
        if let Some(running) = &self.running {
            running.spool.lock().reset();
        }
        self.offset_store().await?.delete(&self.name).await?;
        info!("Reset spool position of '{}'", self.name);
        Ok(())
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

    async fn load_position(&mut self) -> Result<SpoolPosition> {
        let store = self.offset_store().await?;
        match store.load(&self.name).await? {
            Some(offset) => Ok(offset.position_as()?),
            None => Ok(SpoolPosition::default()),
        }
    }

    fn running(&mut self) -> Result<&mut Running> {
        self.running
            .as_mut()
            .ok_or_else(|| SpoolError::invalid_state(format!("source '{}' is not running", self.name)))
    }
}

#[async_trait]
impl BatchSource for DirectorySource {
    type Error = SpoolError;

    async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(SpoolError::invalid_state(format!(
                "source '{}' is already running",
                self.name
            )));
        }
        self.config.check()?;

        let scanner = DirectoryScanner::from_config(&self.config)?;
        if !scanner.root_exists() {
            if !self.config.allow_late_directory {
                return Err(SpoolError::config(format!(
                    "files_directory {} does not exist",
                    self.config.files_directory.display()
                )));
            }
            warn!(
                "files_directory {} does not exist yet, waiting for it",
                self.config.files_directory.display()
            );
        }

        let post = PostProcessor::new(&self.config);
        post.prepare()?;
        let plan = FormatPlan::compile(&self.config.data_format, self.config.resolved_charset()?)?;
        let position = self.load_position().await?;
        if !position.is_empty() {
            info!(
                "Restored position of '{}': {} consumed, {} partially read",
                self.name,
                position.consumed.len(),
                position.offsets.len()
            );
        }

        let spool = Arc::new(Mutex::new(Spool::new(self.config.read_order, position)));
        let (sender, receiver) = batch::channel(self.config.max_pending_batches);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let threads = self.config.number_of_threads;
        let settings = Arc::new(WorkerSettings {
            base_dir: self.config.files_directory.clone(),
            batch_size: self.config.batch_size_in_recs,
            span_files: threads == 1,
            spooling_period: self.config.spooling_period(),
            batch_wait_time: self.config.batch_wait_time(),
            allow_late_directory: self.config.allow_late_directory,
            scanner,
            plan,
        });

        let workers = (0..threads)
            .map(|index| {
                let worker = Worker {
                    index,
                    settings: Arc::clone(&settings),
                    spool: Arc::clone(&spool),
                    sender: sender.clone(),
                    shutdown: shutdown_rx.clone(),
                    stats: Arc::clone(&self.stats),
                    healthy: Arc::clone(&self.healthy),
                    root_seen: settings.scanner.root_exists(),
                };
                tokio::task::spawn_blocking(move || worker.run())
            })
            .collect();

        let reaper = match (&self.config.archive_directory, self.config.archive_retention()) {
            (Some(dir), Some(retention))
                if self.config.file_post_processing == PostProcessing::Archive =>
            {
                Some(ArchiveReaper::new(dir, retention).spawn(shutdown_rx.clone()))
            }
            _ => None,
        };

        self.healthy.store(true, Ordering::SeqCst);
        self.running = Some(Running {
            receiver,
            spool,
            post,
            shutdown,
            workers,
            reaper,
        });
        info!(
            "Directory source '{}' started on {} with {} worker(s)",
            self.name,
            self.config.files_directory.display(),
            threads
        );
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
        let stats = Arc::clone(&self.stats);
        let store = self.offset_store().await?;
        let running = self.running()?;
        let commit = running.receiver.take_commit(batch_id)?;
        let mut report = AckReport::new(batch_id, commit.records);

        running.spool.lock().commit(&commit);

        if !commit.completed.is_empty() {
            let post = running.post.clone();
            let completed = commit.completed.clone();
            let outcomes = tokio::task::spawn_blocking(move || {
                completed
                    .iter()
                    .map(|file| (file.entry.relative.clone(), post.finish(file)))
                    .collect::<Vec<_>>()
            })
            .await
            .map_err(|e| SpoolError::invalid_state(format!("post-processing task failed: {e}")))?;

            let mut spool = running.spool.lock();
            for (file, completed) in outcomes.into_iter().zip(&commit.completed) {
                let (relative, outcome) = file;
                match (outcome, &completed.outcome) {
                    (Ok(disposition), FileOutcome::Consumed) => {
                        stats.record_file_completed();
                        if disposition.removed() {
                            spool.forget(&relative);
                        }
                    }
                    (Ok(disposition), FileOutcome::Failed { .. }) => {
                        stats.record_file_failed();
                        if disposition.removed() {
                            spool.forget(&relative);
                        }
                    }
                    (Err(e), _) => {
                        warn!("{}", e);
                        stats.record_post_process_failure();
                        report.failures.push(e.to_string());
                    }
                }
            }
        }

        let position = running.spool.lock().position().clone();
        store.save(&Offset::new(name, &position)?).await?;
        debug!("Acknowledged {} ({} records)", batch_id, report.records);
        Ok(report)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        running.receiver.close();

        let grace = self.config.stop_grace_period();
        let joined = tokio::time::timeout(grace, futures::future::join_all(running.workers)).await;
        if joined.is_err() {
            warn!(
                "Workers of '{}' did not stop within {:?}",
                self.name, grace
            );
        }
        if let Some(reaper) = running.reaper.take() {
            reaper.abort();
        }
        self.healthy.store(false, Ordering::SeqCst);
        info!("Directory source '{}' stopped", self.name);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.is_some() && self.healthy.load(Ordering::SeqCst)
    }
}

struct WorkerSettings {
    base_dir: PathBuf,
    batch_size: usize,
    span_files: bool,
    spooling_period: Duration,
    batch_wait_time: Duration,
    allow_late_directory: bool,
    scanner: DirectoryScanner,
    plan: FormatPlan,
}

struct Worker {
    index: usize,
    settings: Arc<WorkerSettings>,
    spool: Arc<Mutex<Spool>>,
    sender: BatchSender<SpoolCommit, SpoolError>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<SpoolStats>,
    healthy: Arc<AtomicBool>,
    root_seen: bool,
}

impl Worker {
    fn run(mut self) {
        debug!("Spool worker {} started", self.index);
        match self.work() {
            Ok(()) => debug!("Spool worker {} stopped", self.index),
            Err(e) if self.stopping() => debug!("Spool worker {} stopped: {}", self.index, e),
            Err(e) => {
                error!("Spool worker {} failed: {}", self.index, e);
                if e.is_fatal() {
                    self.healthy.store(false, Ordering::SeqCst);
                }
                self.sender.blocking_fail(e);
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn work(&mut self) -> Result<()> {
        let mut assembler = BatchAssembler::new(self.settings.batch_size);
        let mut cursor: Option<FileCursor> = None;
        let mut last_delivery = Instant::now();

        while !self.stopping() {
            if cursor.is_none() {
                cursor = self.open_next(&mut assembler)?;
            }

            let Some(current) = cursor.as_mut() else {
                if assembler.has_content() {
                    self.deliver(&mut assembler)?;
                    last_delivery = Instant::now();
                } else if self.index == 0 && last_delivery.elapsed() >= self.settings.batch_wait_time {
                    self.deliver(&mut assembler)?;
                    last_delivery = Instant::now();
                } else {
                    self.nap();
                }
                continue;
            };

            match assembler.fill(current) {
                Assembled::Full => {
                    self.deliver(&mut assembler)?;
                    last_delivery = Instant::now();
                }
                Assembled::FileDone | Assembled::FileFailed => {
                    debug!("Finished reading {}", current.relative());
                    cursor = None;
                    if !self.settings.span_files || assembler.is_full() {
                        self.deliver(&mut assembler)?;
                        last_delivery = Instant::now();
                    }
                }
            }
        }

        if let Some(current) = cursor {
            self.spool.lock().release(current.relative());
        }
        Ok(())
    }

    /// Claim and open the next file, rescanning when the spool is dry.
    fn open_next(&mut self, assembler: &mut BatchAssembler) -> Result<Option<FileCursor>> {
        let settings = Arc::clone(&self.settings);
        loop {
            let scan_due = self.spool.lock().scan_due(settings.spooling_period);
            if scan_due {
                self.rescan()?;
            }

            let Some((entry, resume_at)) = self.spool.lock().claim() else {
                return Ok(None);
            };

            let relative = entry.relative.clone();
            match FileCursor::open(entry.clone(), &settings.base_dir, &settings.plan, resume_at) {
                Ok(cursor) => {
                    self.stats.record_file_started();
                    if resume_at > 0 {
                        info!("Resuming {} at offset {}", relative, resume_at);
                    } else {
                        debug!("Opened {}", relative);
                    }
                    return Ok(Some(cursor));
                }
                Err(FormatError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("{} disappeared before it was read", relative);
                    let mut spool = self.spool.lock();
                    spool.release(&relative);
                    spool.forget(&relative);
                }
                Err(e) => {
                    let base = settings.base_dir.to_string_lossy().into_owned();
                    assembler.fail_open(entry, &base, resume_at, &e);
                    if !settings.span_files || assembler.is_full() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn rescan(&mut self) -> Result<()> {
        let scanner = &self.settings.scanner;
        let entries = match scanner.scan() {
            Ok(entries) => {
                self.root_seen = true;
                entries
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.root_seen && !self.settings.allow_late_directory {
                    return Err(SpoolError::DirectoryUnavailable(format!(
                        "{}: {}",
                        scanner.root().display(),
                        e
                    )));
                }
                debug!("Waiting for {} to appear", scanner.root().display());
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to scan {}: {}", scanner.root().display(), e);
                Vec::new()
            }
        };

        let added = self.spool.lock().refill(entries);
        if added > 0 {
            debug!("Spooled {} new file(s)", added);
        }
        Ok(())
    }

    fn deliver(&self, assembler: &mut BatchAssembler) -> Result<()> {
        let (batch, commit) = assembler.take(self.sender.next_batch_id());
        self.stats.record_batch(batch.records.len(), batch.errors.len());
        debug!(
            "Worker {} produced {} ({} records, {} errors)",
            self.index,
            batch.id,
            batch.records.len(),
            batch.errors.len()
        );
        self.sender
            .blocking_send(batch, commit)
            .map_err(|e| match e {
                CoreError::QueueClosed if self.stopping() => SpoolError::invalid_state("stopping"),
                other => other.into(),
            })
    }

    fn nap(&self) {
        let until = Instant::now() + IDLE_SLICE.min(self.settings.spooling_period);
        while Instant::now() < until && !self.stopping() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
