//! Reading records out of one file
//!
//! A [`FileCursor`] owns the open file and its decoder, turns decoded items
//! into [`Record`]s with spool headers, and tracks the offset from which the
//! file can be resumed after the last item it returned.

use crate::error::SpoolError;
use crate::format::{ByteReader, Decode, DecodedItem, Decoder, FileContext, FormatError, FormatPlan};
use crate::scanner::SpoolEntry;
use sluice_core::{ErrorRecord, Field, Record};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub const HEADER_FILE: &str = "file";
pub const HEADER_FILENAME: &str = "filename";
pub const HEADER_OFFSET: &str = "offset";
pub const HEADER_BASE_DIR: &str = "baseDir";
pub const HEADER_MTIME: &str = "mtime";
pub const HEADER_ORDINAL: &str = "record_ordinal";
pub const HEADER_TRUNCATED: &str = "truncated";

/// One item read from a file.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorItem {
    Record(Record),
    Error(ErrorRecord),
}

pub struct FileCursor {
    entry: SpoolEntry,
    base_dir: String,
    decoder: Decoder,
    input: ByteReader,
    offset: u64,
    ordinal: u64,
}

impl FileCursor {
    /// Open `entry` and position it at `resume_at`.
    pub fn open(
        entry: SpoolEntry,
        base_dir: &Path,
        plan: &FormatPlan,
        resume_at: u64,
    ) -> Result<Self, FormatError> {
        let context = FileContext {
            path: entry.path.clone(),
            size: entry.size,
            modified: entry.modified,
        };
        let mut input = if plan.reads_content() {
            ByteReader::new(BufReader::new(File::open(&entry.path)?))
        } else {
            ByteReader::from_bytes(Vec::new())
        };
        let mut decoder = plan.decoder(&context);
        decoder.start(&mut input, resume_at)?;

        Ok(Self {
            entry,
            base_dir: base_dir.to_string_lossy().into_owned(),
            decoder,
            input,
            offset: resume_at,
            ordinal: 0,
        })
    }

    pub fn entry(&self) -> &SpoolEntry {
        &self.entry
    }

    pub fn relative(&self) -> &str {
        &self.entry.relative
    }

    /// Offset to resume from after everything returned so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next record or error record; `None` once the file is exhausted.
    pub fn next_item(&mut self) -> Result<Option<CursorItem>, FormatError> {
        loop {
            let Some(decoded) = self.decoder.next(&mut self.input)? else {
                return Ok(None);
            };
            self.offset = decoded.end;

            match decoded.item {
                DecodedItem::Skipped => continue,
                DecodedItem::Record { root, truncated } => {
                    let mut record = self.record(decoded.start, root);
                    if truncated {
                        record.header.set(HEADER_TRUNCATED, "true");
                    }
                    return Ok(Some(CursorItem::Record(record)));
                }
                DecodedItem::Invalid { raw, reason } => {
                    let error = self.decode_error(decoded.start, reason);
                    let record = self.record(decoded.start, raw);
                    return Ok(Some(CursorItem::Error(ErrorRecord::new(
                        record,
                        error.error_code(),
                        error.to_string(),
                    ))));
                }
            }
        }
    }

    /// Error record describing a file-level failure at the current offset.
    pub fn failure(&self, error: &FormatError) -> ErrorRecord {
        failure_record(&self.entry, &self.base_dir, self.offset, error)
    }

    fn decode_error(&self, offset: u64, message: impl Into<String>) -> SpoolError {
        SpoolError::Decode {
            file: self.entry.path.display().to_string(),
            offset,
            message: message.into(),
        }
    }

    fn record(&mut self, start: u64, root: Field) -> Record {
        self.ordinal += 1;
        let mut record = Record::new(format!("{}::{}", self.entry.relative, start), root);
        stamp_headers(&mut record, &self.entry, &self.base_dir, start);
        record.header.set(HEADER_ORDINAL, self.ordinal.to_string());
        record
    }
}

/// Error record for a file that could not be opened or decoded as a whole.
pub fn failure_record(entry: &SpoolEntry, base_dir: &str, offset: u64, error: &FormatError) -> ErrorRecord {
    let decode = SpoolError::Decode {
        file: entry.path.display().to_string(),
        offset,
        message: error.to_string(),
    };
    let root = Field::map_from([("file", Field::string(entry.path.display().to_string()))]);
    let mut record = Record::new(format!("{}::{}", entry.relative, offset), root);
    stamp_headers(&mut record, entry, base_dir, offset);
    ErrorRecord::new(record, decode.error_code(), decode.to_string())
}

fn stamp_headers(record: &mut Record, entry: &SpoolEntry, base_dir: &str, offset: u64) {
    let header = &mut record.header;
    header.set(HEADER_FILE, entry.path.display().to_string());
    header.set(HEADER_FILENAME, entry.file_name());
    header.set(HEADER_OFFSET, offset.to_string());
    header.set(HEADER_BASE_DIR, base_dir);
    header.set(HEADER_MTIME, entry.modified.timestamp_millis().to_string());
}
