//! LOG: one record per line, fields extracted with a regular expression.

use super::{trim_line_ending, truncate_chars, ByteReader, Decode, Decoded, DecodedItem, FormatError};
use crate::charset::Charset;
use crate::config::{LogConfig, LogFormat};
use crate::error::{Result, SpoolError};
use indexmap::IndexMap;
use regex::Regex;
use sluice_core::Field;
use std::sync::{Arc, LazyLock};
use tracing::debug;

const CLF_PATTERN: &str =
    r#"(\S+) (\S+) (\S+) \[([^\]]+)\] "(\S+) (\S+) (\S+)" (\d{3}) (\S+)"#;

static COMMON_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(CLF_PATTERN).expect("Invalid common log format regex - this is a bug")
});

static COMBINED_LOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r#"{CLF_PATTERN} "([^"]*)" "([^"]*)""#))
        .expect("Invalid combined log format regex - this is a bug")
});

const CLF_FIELDS: [&str; 9] = [
    "/clientip",
    "/ident",
    "/auth",
    "/timestamp",
    "/verb",
    "/request",
    "/httpversion",
    "/response",
    "/bytes",
];

const COMBINED_EXTRA_FIELDS: [&str; 2] = ["/referrer", "/agent"];

/// Compiled LOG settings, shared by every worker.
#[derive(Debug, Clone)]
pub struct LogPlan {
    format: LogFormat,
    regex: Regex,
    mapping: Vec<(String, usize)>,
    retain_original_line: bool,
    max_line_length: usize,
}

impl LogPlan {
    pub fn compile(config: &LogConfig) -> Result<Self> {
        let (regex, mapping) = match config.log_format {
            LogFormat::CommonLogFormat => (COMMON_LOG.clone(), numbered(CLF_FIELDS.iter())),
            LogFormat::CombinedLogFormat => (
                COMBINED_LOG.clone(),
                numbered(CLF_FIELDS.iter().chain(COMBINED_EXTRA_FIELDS.iter())),
            ),
            LogFormat::Regex => {
                let pattern = config
                    .regex
                    .as_deref()
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| SpoolError::config("regex is required for log_format REGEX"))?;
                let regex = Regex::new(pattern)
                    .map_err(|e| SpoolError::config(format!("invalid log regex: {e}")))?;

                let mapping = if config.field_path_to_group.is_empty() {
                    regex
                        .capture_names()
                        .enumerate()
                        .filter_map(|(idx, name)| name.map(|n| (format!("/{n}"), idx)))
                        .collect()
                } else {
                    config
                        .field_path_to_group
                        .iter()
                        .map(|m| (m.field_path.clone(), m.group))
                        .collect()
                };
                (regex, mapping)
            }
        };

        Ok(Self {
            format: config.log_format,
            regex,
            mapping,
            retain_original_line: config.retain_original_line,
            max_line_length: config.max_line_length,
        })
    }

    /// Build the record root for `line`, or `None` when it does not match.
    pub fn parse(&self, line: &str) -> Option<Field> {
        let captures = self.regex.captures(line)?;
        let mut root = Field::map(IndexMap::new());
        for (path, group) in &self.mapping {
            let field = captures
                .get(*group)
                .map(|m| Field::string(m.as_str()))
                .unwrap_or_else(Field::null);
            root.insert(path, field);
        }
        if self.retain_original_line {
            root.insert("/originalLine", Field::string(line));
        }
        Some(root)
    }
}

fn numbered<'a>(paths: impl Iterator<Item = &'a &'static str>) -> Vec<(String, usize)> {
    paths
        .enumerate()
        .map(|(idx, path)| ((*path).to_string(), idx + 1))
        .collect()
}

pub struct LogDecoder {
    plan: Arc<LogPlan>,
    charset: Charset,
    buf: Vec<u8>,
}

impl LogDecoder {
    pub fn new(plan: Arc<LogPlan>, charset: Charset) -> Self {
        Self {
            plan,
            charset,
            buf: Vec::new(),
        }
    }
}

impl Decode for LogDecoder {
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> std::result::Result<(), FormatError> {
        if resume_at == 0 {
            input.skip_bom(self.charset)?;
        } else {
            input.seek_to(resume_at)?;
        }
        Ok(())
    }

    fn next(&mut self, input: &mut ByteReader) -> std::result::Result<Option<Decoded>, FormatError> {
        let start = input.position();
        if input.read_line(&mut self.buf)? == 0 {
            return Ok(None);
        }
        let end = input.position();

        let mut line = self.charset.decode(trim_line_ending(&self.buf));
        let truncated = truncate_chars(&mut line, self.plan.max_line_length);

        let decoded = match self.plan.parse(&line) {
            Some(root) => Decoded {
                start,
                end,
                item: DecodedItem::Record { root, truncated },
            },
            None if self.plan.format == LogFormat::Regex => {
                debug!("Log line at offset {} does not match the regex", start);
                Decoded::skipped(start, end)
            }
            None => Decoded::invalid(
                start,
                end,
                Field::string(line),
                format!("line does not match {:?}", self.plan.format),
            ),
        };
        Ok(Some(decoded))
    }
}
