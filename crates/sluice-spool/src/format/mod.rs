//! # Record format decoders
//!
//! Each supported data format is one variant of the closed [`Decoder`] enum
//! and implements [`Decode`]. A decoder pulls bytes from a [`ByteReader`] and
//! yields one [`Decoded`] item at a time, each carrying the offset at which
//! decoding can restart after it.
//!
//! | format     | restart offset                      | record root                   |
//! |------------|-------------------------------------|-------------------------------|
//! | TEXT       | byte after the line                 | `{ "text": .. }`              |
//! | DELIMITED  | byte after the row                  | list, or map with a header    |
//! | LOG        | byte after the line                 | map built from group mapping  |
//! | JSON       | byte after the object               | converted JSON value          |
//! | XML        | byte after the record element       | element map                   |
//! | BINARY     | end of file                         | bytes                         |
//! | WHOLE_FILE | end of file                         | `{ fileRef, fileInfo }`       |
//!
//! Two failure levels exist. A bad row is reported in-band as
//! [`DecodedItem::Invalid`] and decoding continues. A [`FormatError`] means
//! the rest of the file cannot be decoded; the spooler abandons the file.

mod binary;
mod delimited;
mod json;
mod log;
mod text;
mod xml;

pub use binary::{BinaryDecoder, WholeFileDecoder};
pub use delimited::{DelimitedDecoder, Tokenized, Tokenizer};
pub use json::{json_to_field, JsonDecoder};
pub use log::{LogDecoder, LogPlan};
pub use text::TextDecoder;
pub use xml::XmlDecoder;

use crate::charset::Charset;
use crate::config::{
    BinaryConfig, DataFormat, DelimitedConfig, JsonConfig, TextConfig, XmlConfig,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use sluice_core::Field;
use std::io::{self, BufRead, Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// File-level decode failure.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed {format} content at offset {offset}: {message}")]
    Malformed {
        format: &'static str,
        offset: u64,
        message: String,
    },

    #[error("File size {size} exceeds max_data_size {limit}")]
    TooLarge { size: u64, limit: u64 },
}

impl FormatError {
    pub fn malformed(format: &'static str, offset: u64, message: impl Into<String>) -> Self {
        Self::Malformed {
            format,
            offset,
            message: message.into(),
        }
    }
}

/// One decoded item plus its byte range.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Offset where the item starts
    pub start: u64,
    /// Offset to restart from after this item
    pub end: u64,
    pub item: DecodedItem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedItem {
    Record { root: Field, truncated: bool },
    /// A row that could not be decoded; `raw` holds what was read
    Invalid { raw: Field, reason: String },
    /// Consumed input that yields nothing (comments, non-matching log lines)
    Skipped,
}

impl Decoded {
    pub fn record(start: u64, end: u64, root: Field) -> Self {
        Self {
            start,
            end,
            item: DecodedItem::Record {
                root,
                truncated: false,
            },
        }
    }

    pub fn invalid(start: u64, end: u64, raw: Field, reason: impl Into<String>) -> Self {
        Self {
            start,
            end,
            item: DecodedItem::Invalid {
                raw,
                reason: reason.into(),
            },
        }
    }

    pub fn skipped(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            item: DecodedItem::Skipped,
        }
    }
}

/// Decode capability shared by every format.
pub trait Decode {
    /// Position the decoder. `resume_at` is 0 or an `end` offset previously
    /// reported for the same file.
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> std::result::Result<(), FormatError>;

    /// Next item, or `None` at end of input.
    fn next(&mut self, input: &mut ByteReader) -> std::result::Result<Option<Decoded>, FormatError>;
}

/// Buffered, seekable byte source tracking its absolute position.
pub trait ReadSeek: BufRead + Seek + Send {}

impl<T: BufRead + Seek + Send> ReadSeek for T {}

pub struct ByteReader {
    inner: Box<dyn ReadSeek>,
    position: u64,
}

impl ByteReader {
    /// Wrap a reader positioned at offset 0.
    pub fn new(inner: impl ReadSeek + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            position: 0,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Cursor::new(bytes.into()))
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.position = self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Skip a byte order mark of `charset` at the current position.
    pub fn skip_bom(&mut self, charset: Charset) -> io::Result<()> {
        let len = charset.bom_len(self.inner.fill_buf()?);
        self.inner.consume(len);
        self.position += len as u64;
        Ok(())
    }

    /// Read through the next `\n` (inclusive) into `buf`. Returns bytes read.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        let n = self.inner.read_until(b'\n', buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read through the next occurrence of `delimiter` (inclusive) or EOF.
    pub fn read_record(&mut self, delimiter: &[u8], buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        let Some(&last) = delimiter.last() else {
            return self.read_line(buf);
        };
        loop {
            let n = self.inner.read_until(last, buf)?;
            self.position += n as u64;
            if n == 0 || buf.ends_with(delimiter) || buf.last() != Some(&last) {
                return Ok(buf.len());
            }
        }
    }

    /// Read everything from the current position.
    pub fn read_to_end(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let n = self.inner.read_to_end(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read at most `limit` bytes from the current position.
    pub fn read_limited(&mut self, limit: u64, buf: &mut Vec<u8>) -> io::Result<usize> {
        let n = self.inner.by_ref().take(limit).read_to_end(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Decode the remaining input as one text document.
    ///
    /// Returns the offset the text starts at (past any byte order mark).
    /// Offsets into the text map onto file offsets for UTF-8 input; for other
    /// charsets they are offsets into the decoded text, which is stable
    /// across restarts because the document is always decoded from the start.
    pub fn read_document(&mut self, charset: Charset) -> io::Result<(u64, String)> {
        self.skip_bom(charset)?;
        let base = self.position;
        let mut bytes = Vec::new();
        self.read_to_end(&mut bytes)?;
        Ok((base, charset.decode(&bytes)))
    }
}

/// Strip a trailing `\n` or `\r\n`.
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Truncate `text` to `max` characters; returns whether it was cut.
pub fn truncate_chars(text: &mut String, max: usize) -> bool {
    match text.char_indices().nth(max) {
        Some((idx, _)) => {
            text.truncate(idx);
            true
        }
        None => false,
    }
}

/// File facts available to decoders.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContext {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Format settings compiled once per source and shared by all workers.
#[derive(Debug, Clone)]
pub struct FormatPlan {
    charset: Charset,
    kind: PlanKind,
}

#[derive(Debug, Clone)]
enum PlanKind {
    Text(Arc<TextConfig>),
    Delimited(Arc<DelimitedConfig>),
    Log(Arc<LogPlan>),
    Json(JsonConfig),
    Xml(XmlConfig),
    Binary(BinaryConfig),
    WholeFile,
}

impl FormatPlan {
    pub fn compile(format: &DataFormat, charset: Charset) -> Result<Self> {
        let kind = match format {
            DataFormat::Text(c) => PlanKind::Text(Arc::new(c.clone())),
            DataFormat::Delimited(c) => PlanKind::Delimited(Arc::new(c.clone())),
            DataFormat::Log(c) => PlanKind::Log(Arc::new(LogPlan::compile(c)?)),
            DataFormat::Json(c) => PlanKind::Json(c.clone()),
            DataFormat::Xml(c) => PlanKind::Xml(c.clone()),
            DataFormat::Binary(c) => PlanKind::Binary(c.clone()),
            DataFormat::WholeFile(_) => PlanKind::WholeFile,
        };
        Ok(Self { charset, kind })
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// WHOLE_FILE records reference the file; nothing is read.
    pub fn reads_content(&self) -> bool {
        !matches!(self.kind, PlanKind::WholeFile)
    }

    /// Fresh per-file decoder.
    pub fn decoder(&self, file: &FileContext) -> Decoder {
        let charset = self.charset;
        match &self.kind {
            PlanKind::Text(c) => Decoder::Text(TextDecoder::new(c, charset)),
            PlanKind::Delimited(c) => Decoder::Delimited(DelimitedDecoder::new(Arc::clone(c), charset)),
            PlanKind::Log(plan) => Decoder::Log(LogDecoder::new(Arc::clone(plan), charset)),
            PlanKind::Json(c) => Decoder::Json(JsonDecoder::new(c, charset)),
            PlanKind::Xml(c) => Decoder::Xml(XmlDecoder::new(c, charset)),
            PlanKind::Binary(c) => Decoder::Binary(BinaryDecoder::new(c)),
            PlanKind::WholeFile => Decoder::WholeFile(WholeFileDecoder::new(file.clone())),
        }
    }
}

/// Closed set of decoders, one per data format.
pub enum Decoder {
    Text(TextDecoder),
    Delimited(DelimitedDecoder),
    Log(LogDecoder),
    Json(JsonDecoder),
    Xml(XmlDecoder),
    Binary(BinaryDecoder),
    WholeFile(WholeFileDecoder),
}

impl Decode for Decoder {
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> std::result::Result<(), FormatError> {
        match self {
            Self::Text(d) => d.start(input, resume_at),
            Self::Delimited(d) => d.start(input, resume_at),
            Self::Log(d) => d.start(input, resume_at),
            Self::Json(d) => d.start(input, resume_at),
            Self::Xml(d) => d.start(input, resume_at),
            Self::Binary(d) => d.start(input, resume_at),
            Self::WholeFile(d) => d.start(input, resume_at),
        }
    }

    fn next(&mut self, input: &mut ByteReader) -> std::result::Result<Option<Decoded>, FormatError> {
        match self {
            Self::Text(d) => d.next(input),
            Self::Delimited(d) => d.next(input),
            Self::Log(d) => d.next(input),
            Self::Json(d) => d.next(input),
            Self::Xml(d) => d.next(input),
            Self::Binary(d) => d.next(input),
            Self::WholeFile(d) => d.next(input),
        }
    }
}

#[cfg(test)]
pub(crate) fn decode_all(decoder: &mut impl Decode, bytes: &[u8]) -> Vec<Decoded> {
    let mut input = ByteReader::from_bytes(bytes.to_vec());
    decoder.start(&mut input, 0).unwrap();
    let mut out = Vec::new();
    while let Some(item) = decoder.next(&mut input).unwrap() {
        out.push(item);
    }
    out
}
