//! DELIMITED: character-separated rows.
//!
//! The tokenizer is dialect driven rather than RFC 4180 strict:
//!
//! - outside quotes, the escape character makes the next character literal
//!   (`a\,b` is a single field `a,b`);
//! - a field that starts with the quote character runs to the matching quote,
//!   a doubled quote inside it is a literal quote, and the escape character
//!   also works there when it differs from the quote;
//! - characters following a closing quote are appended to the field;
//! - a quoted field may span physical lines.

use super::{ByteReader, Decode, Decoded, FormatError};
use crate::charset::Charset;
use crate::config::{DelimitedConfig, HeaderLine};
use indexmap::IndexMap;
use sluice_core::Field;
use std::sync::Arc;

/// Result of tokenizing one logical row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tokenized {
    Complete(Vec<String>),
    /// The text ends inside a quoted field
    Incomplete,
}

/// Splits a row into fields for one dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tokenizer {
    delimiter: char,
    quote: Option<char>,
    escape: Option<char>,
}

impl Tokenizer {
    pub fn new(delimiter: char, quote: Option<char>, escape: Option<char>) -> Self {
        // An escape equal to the quote is the doubled-quote rule.
        let escape = escape.filter(|e| Some(*e) != quote);
        Self {
            delimiter,
            quote,
            escape,
        }
    }

    pub fn for_config(config: &DelimitedConfig) -> Self {
        let (delimiter, quote, escape) = config.dialect();
        Self::new(delimiter, quote, escape)
    }

    /// Tokenize `text`, which must not carry its final line ending.
    pub fn tokenize(&self, text: &str) -> Tokenized {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut chars = text.chars().peekable();
        let mut in_quotes = false;
        let mut at_field_start = true;

        while let Some(c) = chars.next() {
            if in_quotes {
                if Some(c) == self.escape {
                    match chars.next() {
                        Some(next) => field.push(next),
                        None => return Tokenized::Incomplete,
                    }
                } else if Some(c) == self.quote {
                    if chars.peek() == Some(&c) {
                        chars.next();
                        field.push(c);
                    } else {
                        in_quotes = false;
                    }
                } else {
                    field.push(c);
                }
                continue;
            }

            if Some(c) == self.escape {
                field.push(chars.next().unwrap_or(c));
                at_field_start = false;
            } else if c == self.delimiter {
                fields.push(std::mem::take(&mut field));
                at_field_start = true;
            } else if at_field_start && Some(c) == self.quote {
                in_quotes = true;
                at_field_start = false;
            } else {
                field.push(c);
                at_field_start = false;
            }
        }

        if in_quotes {
            return Tokenized::Incomplete;
        }
        fields.push(field);
        Tokenized::Complete(fields)
    }
}

enum Row {
    Fields(Vec<String>),
    Ignored,
    Unterminated(String),
    TooLong(String),
}

pub struct DelimitedDecoder {
    config: Arc<DelimitedConfig>,
    charset: Charset,
    tokenizer: Tokenizer,
    headers: Option<Vec<String>>,
    buf: Vec<u8>,
}

impl DelimitedDecoder {
    pub fn new(config: Arc<DelimitedConfig>, charset: Charset) -> Self {
        let tokenizer = Tokenizer::for_config(&config);
        Self {
            config,
            charset,
            tokenizer,
            headers: None,
            buf: Vec::new(),
        }
    }

    /// Column names read from the header row, if any.
    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    fn exceeds_limit(&self, text: &str) -> bool {
        self.config
            .max_record_length
            .is_some_and(|max| text.chars().count() > max)
    }

    /// Read one logical row, joining physical lines while a quote is open.
    fn read_row(&mut self, input: &mut ByteReader) -> Result<Option<Row>, FormatError> {
        if input.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        let mut text = self.charset.decode(&self.buf);

        let first = strip_line_ending(&text);
        if self.config.enable_comments && first.starts_with(self.config.comment_marker) {
            return Ok(Some(Row::Ignored));
        }
        if first.is_empty() && self.config.skip_empty_lines {
            return Ok(Some(Row::Ignored));
        }

        loop {
            let content = strip_line_ending(&text);
            match self.tokenizer.tokenize(content) {
                Tokenized::Complete(_) if self.exceeds_limit(content) => {
                    return Ok(Some(Row::TooLong(content.to_string())));
                }
                Tokenized::Complete(fields) => return Ok(Some(Row::Fields(fields))),
                Tokenized::Incomplete => {
                    if self.exceeds_limit(content) {
                        return Ok(Some(Row::TooLong(content.to_string())));
                    }
                    if input.read_line(&mut self.buf)? == 0 {
                        return Ok(Some(Row::Unterminated(content.to_string())));
                    }
                    text.push_str(&self.charset.decode(&self.buf));
                }
            }
        }
    }

    fn value(&self, raw: String) -> Field {
        if self.config.parse_nulls && raw == self.config.null_constant {
            Field::null()
        } else {
            Field::string(raw)
        }
    }

    fn build(&self, start: u64, end: u64, fields: Vec<String>) -> Decoded {
        let Some(headers) = &self.headers else {
            let items = fields.into_iter().map(|f| self.value(f)).collect();
            return Decoded::record(start, end, Field::list(items));
        };

        if fields.len() > headers.len() && !self.config.allow_extra_columns {
            let reason = format!(
                "row has {} columns but the header has {}",
                fields.len(),
                headers.len()
            );
            let columns = Field::list(fields.into_iter().map(Field::string).collect());
            return Decoded::invalid(start, end, Field::map_from([("columns", columns)]), reason);
        }

        let mut map = IndexMap::with_capacity(fields.len());
        for (idx, raw) in fields.into_iter().enumerate() {
            let key = match headers.get(idx) {
                Some(name) => name.clone(),
                None => format!(
                    "{}{:02}",
                    self.config.extra_column_prefix,
                    idx - headers.len() + 1
                ),
            };
            map.insert(key, self.value(raw));
        }
        Decoded::record(start, end, Field::map(map))
    }
}

impl Decode for DelimitedDecoder {
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> Result<(), FormatError> {
        input.skip_bom(self.charset)?;
        self.headers = None;

        if self.config.header_line != HeaderLine::NoHeader {
            loop {
                let start = input.position();
                match self.read_row(input)? {
                    None => break,
                    Some(Row::Ignored) => continue,
                    Some(Row::Fields(names)) => {
                        if self.config.header_line == HeaderLine::WithHeader {
                            self.headers = Some(names);
                        }
                        break;
                    }
                    Some(Row::Unterminated(_) | Row::TooLong(_)) => {
                        return Err(FormatError::malformed(
                            "DELIMITED",
                            start,
                            "header row could not be read",
                        ));
                    }
                }
            }
        }

        if resume_at > input.position() {
            input.seek_to(resume_at)?;
        }
        Ok(())
    }

    fn next(&mut self, input: &mut ByteReader) -> Result<Option<Decoded>, FormatError> {
        let start = input.position();
        let Some(row) = self.read_row(input)? else {
            return Ok(None);
        };
        let end = input.position();

        Ok(Some(match row {
            Row::Ignored => Decoded::skipped(start, end),
            Row::Fields(fields) => self.build(start, end, fields),
            Row::Unterminated(text) => {
                Decoded::invalid(start, end, Field::string(text), "unterminated quoted field")
            }
            Row::TooLong(text) => {
                let max = self.config.max_record_length.unwrap_or_default();
                Decoded::invalid(
                    start,
                    end,
                    Field::string(text),
                    format!("row exceeds max_record_length {max}"),
                )
            }
        }))
    }
}

fn strip_line_ending(text: &str) -> &str {
    let line = text.strip_suffix('\n').unwrap_or(text);
    line.strip_suffix('\r').unwrap_or(line)
}
