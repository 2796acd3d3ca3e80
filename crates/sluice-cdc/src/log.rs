//! Transaction log access
//!
//! [`TransactionLog`] opens a [`LogCursor`] at a [`LogStart`]. Two logs ship
//! with the crate:
//!
//! - [`MemoryLog`]: an in-process log with concurrent appends and retention
//!   truncation.
//! - [`DirectoryLog`]: numbered JSON-lines segments (`1.jsonl`, `2.jsonl`, ...)
//!   tailed as they grow. The writer appends to the newest segment and rolls
//!   over by creating the next number.
//!
//! Positions start at 1 and increase by one per record. Opening at a position
//! or date whose records are no longer retained, or reading across a missing
//! segment, fails with [`CdcError::FatalLogAccess`]: skipping ahead would
//! silently lose changes.

use crate::config::{parse_start_date, StartPosition};
use crate::error::{CdcError, Result};
use crate::event::{LogOp, LogRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// Where a cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStart {
    /// After the newest record
    Latest,
    /// First record logged at or after the timestamp
    Timestamp(DateTime<Utc>),
    /// First record at or after the position
    Position(u64),
}

impl LogStart {
    pub fn from_config(start: &StartPosition) -> Result<Self> {
        Ok(match start {
            StartPosition::Latest => Self::Latest,
            StartPosition::Date { date } => Self::Timestamp(parse_start_date(date)?),
            StartPosition::Position { position } => Self::Position(*position),
        })
    }
}

/// A source of log cursors.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn open(&self, start: LogStart) -> Result<Box<dyn LogCursor>>;
}

/// Sequential reader over a transaction log.
#[async_trait]
pub trait LogCursor: Send {
    /// Position of the next record this cursor will return.
    fn next_position(&self) -> u64;

    /// Next record, or `None` when the reader has caught up with the writer.
    ///
    /// A malformed record yields [`CdcError::Decode`] and is skipped.
    async fn next_record(&mut self) -> Result<Option<LogRecord>>;
}

fn ensure_retained(start: u64, first_available: u64, truncated: bool) -> Result<()> {
    if truncated && start.max(1) < first_available {
        return Err(CdcError::log_access(format!(
            "log position {start} is no longer retained (oldest available is {first_available})"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct MemoryLogState {
    records: VecDeque<LogRecord>,
    next_position: u64,
    truncated: bool,
}

impl MemoryLogState {
    fn first_available(&self) -> u64 {
        self.records
            .front()
            .map_or(self.next_position, |r| r.position)
    }
}

/// In-process transaction log.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    state: Arc<RwLock<MemoryLogState>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryLogState {
                records: VecDeque::new(),
                next_position: 1,
                truncated: false,
            })),
        }
    }

    /// Append a record stamped with the current time; returns its position.
    pub fn append(&self, txn_id: &str, op: LogOp) -> u64 {
        self.append_at(Utc::now(), txn_id, op)
    }

    /// Append a record with an explicit log timestamp.
    pub fn append_at(&self, timestamp: DateTime<Utc>, txn_id: &str, op: LogOp) -> u64 {
        let mut state = self.state.write();
        let position = state.next_position;
        state.next_position += 1;
        state.records.push_back(LogRecord {
            position,
            timestamp,
            txn_id: txn_id.to_string(),
            op,
        });
        position
    }

    /// Drop records before `position`, as log retention would.
    pub fn truncate_before(&self, position: u64) -> usize {
        let mut state = self.state.write();
        let mut removed = 0;
        while state.records.front().is_some_and(|r| r.position < position) {
            state.records.pop_front();
            removed += 1;
        }
        if removed > 0 {
            state.truncated = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the newest record.
    pub fn last_position(&self) -> Option<u64> {
        self.state.read().records.back().map(|r| r.position)
    }
}

#[async_trait]
impl TransactionLog for MemoryLog {
    async fn open(&self, start: LogStart) -> Result<Box<dyn LogCursor>> {
        let state = self.state.read();
        let next = match start {
            LogStart::Latest => state.next_position,
            LogStart::Position(position) => {
                ensure_retained(position, state.first_available(), state.truncated)?;
                position.max(1)
            }
            LogStart::Timestamp(ts) => {
                if state.truncated
                    && state.records.front().map_or(true, |r| r.timestamp > ts)
                {
                    return Err(CdcError::log_access(format!(
                        "records logged at {ts} are no longer retained"
                    )));
                }
                state
                    .records
                    .iter()
                    .find(|r| r.timestamp >= ts)
                    .map_or(state.next_position, |r| r.position)
            }
        };
        Ok(Box::new(MemoryCursor {
            state: Arc::clone(&self.state),
            next,
        }))
    }
}

struct MemoryCursor {
    state: Arc<RwLock<MemoryLogState>>,
    next: u64,
}

#[async_trait]
impl LogCursor for MemoryCursor {
    fn next_position(&self) -> u64 {
        self.next
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let state = self.state.read();
        ensure_retained(self.next, state.first_available(), state.truncated)?;
        let index = state.records.partition_point(|r| r.position < self.next);
        let Some(record) = state.records.get(index) else {
            return Ok(None);
        };
        self.next = record.position + 1;
        Ok(Some(record.clone()))
    }
}

/// Segmented JSON-lines log in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryLog {
    dir: PathBuf,
}

impl DirectoryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segment file for a sequence number.
    pub fn segment_path(&self, seq: u64) -> PathBuf {
        segment_path(&self.dir, seq)
    }

    /// Segment numbers present, ascending; fails on a gap.
    async fn segments(&self) -> Result<Vec<u64>> {
        let seqs = list_segments(&self.dir).await?;
        for pair in seqs.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(CdcError::log_access(format!(
                    "log segment {} is missing from {}",
                    pair[0] + 1,
                    self.dir.display()
                )));
            }
        }
        Ok(seqs)
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq}.jsonl"))
}

async fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut listing = tokio::fs::read_dir(dir).await.map_err(|e| {
        CdcError::log_access(format!("cannot list log directory {}: {e}", dir.display()))
    })?;
    let mut seqs = Vec::new();
    while let Some(entry) = listing.next_entry().await? {
        let name = entry.file_name();
        let Some(seq) = name
            .to_str()
            .and_then(|n| n.strip_suffix(".jsonl"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        seqs.push(seq);
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// Parse every complete record of a segment; malformed lines are skipped.
async fn read_segment(path: &Path) -> Result<Vec<LogRecord>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<LogRecord>(line).ok())
        .collect())
}

#[async_trait]
impl TransactionLog for DirectoryLog {
    async fn open(&self, start: LogStart) -> Result<Box<dyn LogCursor>> {
        let seqs = self.segments().await?;
        let mut firsts = Vec::with_capacity(seqs.len());
        let mut newest = None;
        for seq in &seqs {
            let records = read_segment(&self.segment_path(*seq)).await?;
            firsts.push((*seq, records.first().map(|r| (r.position, r.timestamp))));
            newest = records.last().map(|r| r.position).or(newest);
        }
        let first_available = firsts
            .iter()
            .find_map(|(_, first)| first.map(|(p, _)| p))
            .unwrap_or(1);
        let truncated = first_available > 1;

        let (seq, skip, next) = match start {
            LogStart::Latest => {
                let next = newest.map_or(1, |p| p + 1);
                (seqs.last().copied(), Some(Skip::Before(next)), next)
            }
            LogStart::Position(position) => {
                ensure_retained(position, first_available, truncated)?;
                let seq = firsts
                    .iter()
                    .rev()
                    .find(|(_, first)| first.is_some_and(|(p, _)| p <= position))
                    .or_else(|| firsts.first())
                    .map(|(seq, _)| *seq);
                (seq, Some(Skip::Before(position)), position.max(1))
            }
            LogStart::Timestamp(ts) => {
                let oldest = firsts.iter().find_map(|(_, first)| *first);
                if truncated && oldest.map_or(true, |(_, t)| t > ts) {
                    return Err(CdcError::log_access(format!(
                        "records logged at {ts} are no longer retained"
                    )));
                }
                let seq = firsts
                    .iter()
                    .rev()
                    .find(|(_, first)| first.is_some_and(|(_, t)| t <= ts))
                    .or_else(|| firsts.first())
                    .map(|(seq, _)| *seq);
                (seq, Some(Skip::Until(ts)), first_available)
            }
        };

        debug!(
            "Opened log {} at segment {:?} ({:?})",
            self.dir.display(),
            seq,
            start
        );
        Ok(Box::new(DirectoryCursor {
            dir: self.dir.clone(),
            seq,
            offset: 0,
            lines: VecDeque::new(),
            skip,
            next,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum Skip {
    Before(u64),
    Until(DateTime<Utc>),
}

impl Skip {
    fn skips(&self, record: &LogRecord) -> bool {
        match self {
            Self::Before(position) => record.position < *position,
            Self::Until(ts) => record.timestamp < *ts,
        }
    }
}

struct DirectoryCursor {
    dir: PathBuf,
    seq: Option<u64>,
    /// Bytes of the current segment already split into lines
    offset: u64,
    lines: VecDeque<String>,
    skip: Option<Skip>,
    next: u64,
}

impl DirectoryCursor {
    /// Read newly appended complete lines of the current segment.
    async fn fill(&mut self, seq: u64) -> Result<usize> {
        let path = segment_path(&self.dir, seq);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CdcError::log_access(format!(
                    "log segment {} disappeared while being read",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(0);
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;
        let before = self.lines.len();
        self.lines.extend(
            String::from_utf8_lossy(complete)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string),
        );
        Ok(self.lines.len() - before)
    }

    /// Move to the next segment once the writer created it.
    async fn roll_over(&mut self) -> Result<bool> {
        let seqs = list_segments(&self.dir).await?;
        let target = match self.seq {
            None => seqs.first().copied(),
            Some(current) => {
                let target = current + 1;
                if seqs.contains(&target) {
                    Some(target)
                } else if seqs.iter().any(|s| *s > target) {
                    return Err(CdcError::log_access(format!(
                        "log segment {target} is missing from {}",
                        self.dir.display()
                    )));
                } else {
                    None
                }
            }
        };
        let Some(target) = target else {
            return Ok(false);
        };
        info!("Reading log segment {}", target);
        self.seq = Some(target);
        self.offset = 0;
        Ok(true)
    }
}

#[async_trait]
impl LogCursor for DirectoryCursor {
    fn next_position(&self) -> u64 {
        self.next
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                let record: LogRecord = serde_json::from_str(&line)
                    .map_err(|e| CdcError::decode(self.next, format!("{e}: {line}")))?;
                if self.skip.is_some_and(|skip| skip.skips(&record)) {
                    continue;
                }
                self.skip = None;
                self.next = record.position + 1;
                return Ok(Some(record));
            }

            if let Some(seq) = self.seq {
                if self.fill(seq).await? > 0 {
                    continue;
                }
            }
            if !self.roll_over().await? {
                return Ok(None);
            }
        }
    }
}
