//! Batch assembly
//!
//! A [`BatchAssembler`] drains file cursors into a batch until the batch is
//! full. Alongside the records it builds the [`SpoolCommit`] that the batch
//! stands for: the resume offset of a file left half read and the files the
//! batch finished. Committing happens only when the batch is acknowledged.

use crate::cursor::{failure_record, CursorItem, FileCursor};
use crate::format::FormatError;
use crate::scanner::SpoolEntry;
use sluice_core::{Batch, BatchId};
use tracing::{debug, warn};

/// Resume point of a partially delivered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub relative: String,
    pub offset: u64,
}

/// How a file ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Every record was read
    Consumed,
    /// Decoding the file failed as a whole
    Failed { reason: String },
}

/// A file whose last record is in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub entry: SpoolEntry,
    pub outcome: FileOutcome,
}

/// Everything acknowledging a batch commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpoolCommit {
    pub records: usize,
    pub progress: Vec<FileProgress>,
    pub completed: Vec<CompletedFile>,
}

/// Why [`BatchAssembler::fill`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assembled {
    /// The batch is full; the cursor has more to read
    Full,
    /// The cursor is exhausted and the file was recorded as consumed
    FileDone,
    /// The file failed as a whole and was recorded as failed
    FileFailed,
}

pub struct BatchAssembler {
    max_records: usize,
    batch: Batch,
    progress: Option<FileProgress>,
    completed: Vec<CompletedFile>,
}

impl BatchAssembler {
    pub fn new(max_records: usize) -> Self {
        Self {
            max_records: max_records.max(1),
            batch: Batch::new(BatchId::new(0)),
            progress: None,
            completed: Vec::new(),
        }
    }

    /// True when there is something to deliver.
    pub fn has_content(&self) -> bool {
        !self.batch.is_empty() || !self.completed.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.batch.records.len() >= self.max_records || self.batch.errors.len() >= self.max_records
    }

    pub fn record_count(&self) -> usize {
        self.batch.records.len()
    }

    /// Read from `cursor` until the batch fills or the file ends.
    pub fn fill(&mut self, cursor: &mut FileCursor) -> Assembled {
        while !self.is_full() {
            match cursor.next_item() {
                Ok(Some(CursorItem::Record(record))) => self.batch.records.push(record),
                Ok(Some(CursorItem::Error(error))) => {
                    debug!("Decode error in {}: {}", cursor.relative(), error.message);
                    self.batch.errors.push(error);
                }
                Ok(None) => {
                    self.progress = None;
                    self.completed.push(CompletedFile {
                        entry: cursor.entry().clone(),
                        outcome: FileOutcome::Consumed,
                    });
                    return Assembled::FileDone;
                }
                Err(e) => {
                    let failure = cursor.failure(&e);
                    self.fail_file(cursor.entry().clone(), failure.message.clone(), failure);
                    return Assembled::FileFailed;
                }
            }
        }
        self.progress = Some(FileProgress {
            relative: cursor.relative().to_string(),
            offset: cursor.offset(),
        });
        Assembled::Full
    }

    /// Record a file that could not be opened or decoded.
    pub fn fail_open(&mut self, entry: SpoolEntry, base_dir: &str, resume_at: u64, error: &FormatError) {
        let failure = failure_record(&entry, base_dir, resume_at, error);
        self.fail_file(entry, failure.message.clone(), failure);
    }

    fn fail_file(&mut self, entry: SpoolEntry, reason: String, failure: sluice_core::ErrorRecord) {
        warn!("Abandoning {}: {}", entry.relative, reason);
        self.progress = None;
        self.batch.errors.push(failure);
        self.completed.push(CompletedFile {
            entry,
            outcome: FileOutcome::Failed { reason },
        });
    }

    /// Take the assembled batch and its commit, leaving the assembler empty.
    pub fn take(&mut self, id: BatchId) -> (Batch, SpoolCommit) {
        let mut batch = std::mem::replace(&mut self.batch, Batch::new(BatchId::new(0)));
        batch.id = id;
        let commit = SpoolCommit {
            records: batch.records.len(),
            progress: self.progress.take().into_iter().collect(),
            completed: std::mem::take(&mut self.completed),
        };
        (batch, commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charset::Charset;
    use crate::config::{DataFormat, DelimitedConfig, HeaderLine, TextConfig};
    use crate::format::FormatPlan;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn cursor(dir: &TempDir, name: &str, content: &str, format: DataFormat) -> FileCursor {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        let entry = SpoolEntry::from_path(dir.path(), &path).unwrap();
        let plan = FormatPlan::compile(&format, Charset::utf8()).unwrap();
        FileCursor::open(entry, dir.path(), &plan, 0).unwrap()
    }

    fn text() -> DataFormat {
        DataFormat::Text(TextConfig::default())
    }

    #[test]
    fn test_full_batch_records_progress() {
        let dir = TempDir::new().unwrap();
        let mut c = cursor(&dir, "a.txt", "1\n2\n3\n", text());
        let mut assembler = BatchAssembler::new(2);

        assert_eq!(assembler.fill(&mut c), Assembled::Full);
        let (batch, commit) = assembler.take(BatchId::new(7));
        assert_eq!(batch.id, BatchId::new(7));
        assert_eq!(batch.len(), 2);
        assert_eq!(
            commit.progress,
            vec![FileProgress {
                relative: "a.txt".into(),
                offset: 4
            }]
        );
        assert!(commit.completed.is_empty());

        assert_eq!(assembler.fill(&mut c), Assembled::FileDone);
        let (batch, commit) = assembler.take(BatchId::new(8));
        assert_eq!(batch.len(), 1);
        assert!(commit.progress.is_empty());
        assert_eq!(commit.completed.len(), 1);
        assert_eq!(commit.completed[0].outcome, FileOutcome::Consumed);
    }

    #[test]
    fn test_batch_spans_files() {
        let dir = TempDir::new().unwrap();
        let mut a = cursor(&dir, "a.txt", "1\n2\n", text());
        let mut b = cursor(&dir, "b.txt", "3\n4\n", text());
        let mut assembler = BatchAssembler::new(3);

        assert_eq!(assembler.fill(&mut a), Assembled::FileDone);
        assert_eq!(assembler.fill(&mut b), Assembled::Full);
        let (batch, commit) = assembler.take(BatchId::new(1));
        assert_eq!(batch.len(), 3);
        assert_eq!(commit.completed[0].entry.relative, "a.txt");
        assert_eq!(commit.progress[0].relative, "b.txt");
    }

    #[test]
    fn test_errors_go_to_side_channel() {
        let dir = TempDir::new().unwrap();
        let format = DataFormat::Delimited(DelimitedConfig {
            header_line: HeaderLine::WithHeader,
            ..Default::default()
        });
        let mut c = cursor(&dir, "a.csv", "a,b\n1,2\n3,4,5\n6,7\n", format);
        let mut assembler = BatchAssembler::new(10);

        assert_eq!(assembler.fill(&mut c), Assembled::FileDone);
        let (batch, commit) = assembler.take(BatchId::new(1));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].error_code, "DECODE_ERROR");
        assert_eq!(commit.records, 2);
    }

    #[test]
    fn test_fail_open_records_failed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.txt");
        fs::write(&path, "x").unwrap();
        let entry = SpoolEntry::from_path(dir.path(), &path).unwrap();
        let mut assembler = BatchAssembler::new(10);
        let error = FormatError::malformed("XML", 0, "no root element");
        assembler.fail_open(entry, "/base", 0, &error);

        assert!(assembler.has_content());
        let (batch, commit) = assembler.take(BatchId::new(1));
        assert_eq!(batch.errors.len(), 1);
        assert!(matches!(
            commit.completed[0].outcome,
            FileOutcome::Failed { .. }
        ));
    }
}
