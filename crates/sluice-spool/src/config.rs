//! Configuration for the directory spooler
//!
//! # Example
//!
//! ```yaml
//! files_directory: /var/spool/orders
//! file_name_pattern: "*.csv"
//! read_order: TIMESTAMP
//! file_post_processing: ARCHIVE
//! archive_directory: /var/spool/orders-archive
//! archive_retention_time_in_mins: 1440
//! batch_size_in_recs: 500
//! data_format:
//!   format: DELIMITED
//!   header_line: WITH_HEADER
//!   allow_extra_columns: true
//! ```

use crate::charset::Charset;
use crate::error::{Result, SpoolError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sluice_core::{MatchScope, PatternMatcher, PatternSyntax};
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

/// Directory spooler configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SpoolConfig {
    /// Root directory to watch
    pub files_directory: PathBuf,

    /// File name pattern, matched against the file name only
    #[serde(default = "default_pattern")]
    #[validate(length(min = 1))]
    pub file_name_pattern: String,

    /// GLOB or REGEX
    #[serde(default)]
    pub file_name_pattern_mode: PatternSyntax,

    /// Whether a REGEX pattern must match the whole name (FULL) or any part (PARTIAL)
    #[serde(default)]
    pub regex_match: MatchScope,

    /// Order in which files are consumed
    #[serde(default)]
    pub read_order: ReadOrder,

    /// Scan subdirectories
    #[serde(default)]
    pub process_subdirectories: bool,

    /// Allow starting before `files_directory` exists
    #[serde(default)]
    pub allow_late_directory: bool,

    /// Rescan interval when no file is pending (seconds)
    #[serde(default = "default_spooling_period")]
    #[validate(range(min = 1, max = 86400))]
    pub spooling_period_secs: u64,

    /// An empty batch is delivered after waiting this long without data (seconds)
    #[serde(default = "default_batch_wait")]
    #[validate(range(min = 1, max = 3600))]
    pub batch_wait_time_secs: u64,

    /// Maximum good records per batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000000))]
    pub batch_size_in_recs: usize,

    /// Reader workers; with more than one, batches never span files
    #[serde(default = "default_threads")]
    #[validate(range(min = 1, max = 64))]
    pub number_of_threads: usize,

    /// Depth of the hand-off queue
    #[serde(default = "default_pending_batches")]
    #[validate(range(min = 1, max = 2))]
    pub max_pending_batches: usize,

    /// What happens to a file once all of its records are acknowledged
    #[serde(default)]
    pub file_post_processing: PostProcessing,

    /// Destination for ARCHIVE
    #[serde(default)]
    pub archive_directory: Option<PathBuf>,

    /// Archived files older than this are purged; 0 keeps them forever
    #[serde(default)]
    pub archive_retention_time_in_mins: u64,

    /// Destination for files that fail to decode as a whole
    #[serde(default)]
    pub error_directory: Option<PathBuf>,

    /// Character set label (WHATWG names, e.g. UTF-8, Big5, US-ASCII)
    #[serde(default = "default_charset")]
    pub charset: String,

    /// Directory for the durable cursor; unset keeps it in memory
    #[serde(default)]
    pub offset_directory: Option<PathBuf>,

    /// Grace period for workers on stop (seconds)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_period_secs: u64,

    /// Record format
    #[serde(default)]
    pub data_format: DataFormat,
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_spooling_period() -> u64 {
    5
}

fn default_batch_wait() -> u64 {
    5
}

fn default_batch_size() -> usize {
    1000
}

fn default_threads() -> usize {
    1
}

fn default_pending_batches() -> usize {
    1
}

fn default_charset() -> String {
    "UTF-8".to_string()
}

fn default_stop_grace() -> u64 {
    10
}

impl SpoolConfig {
    /// Configuration with defaults for everything but the directory.
    pub fn new(files_directory: impl Into<PathBuf>) -> Self {
        Self {
            files_directory: files_directory.into(),
            file_name_pattern: default_pattern(),
            file_name_pattern_mode: PatternSyntax::Glob,
            regex_match: MatchScope::Full,
            read_order: ReadOrder::default(),
            process_subdirectories: false,
            allow_late_directory: false,
            spooling_period_secs: default_spooling_period(),
            batch_wait_time_secs: default_batch_wait(),
            batch_size_in_recs: default_batch_size(),
            number_of_threads: default_threads(),
            max_pending_batches: default_pending_batches(),
            file_post_processing: PostProcessing::None,
            archive_directory: None,
            archive_retention_time_in_mins: 0,
            error_directory: None,
            charset: default_charset(),
            offset_directory: None,
            stop_grace_period_secs: default_stop_grace(),
            data_format: DataFormat::default(),
        }
    }

    pub fn spooling_period(&self) -> Duration {
        Duration::from_secs(self.spooling_period_secs)
    }

    pub fn batch_wait_time(&self) -> Duration {
        Duration::from_secs(self.batch_wait_time_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Retention for archived files, if enabled.
    pub fn archive_retention(&self) -> Option<Duration> {
        (self.archive_retention_time_in_mins > 0)
            .then(|| Duration::from_secs(self.archive_retention_time_in_mins * 60))
    }

    /// Compile the file name pattern.
    pub fn matcher(&self) -> Result<PatternMatcher> {
        PatternMatcher::builder(&self.file_name_pattern)
            .syntax(self.file_name_pattern_mode)
            .scope(self.regex_match)
            .build()
            .map_err(|e| {
                SpoolError::config(format!(
                    "invalid file_name_pattern '{}': {}",
                    self.file_name_pattern, e
                ))
            })
    }

    /// Resolve the configured charset.
    pub fn resolved_charset(&self) -> Result<Charset> {
        Charset::for_label(&self.charset)
            .ok_or_else(|| SpoolError::config(format!("unknown charset '{}'", self.charset)))
    }

    /// Full validation: field rules plus cross-field checks.
    ///
    /// Every problem reported here is a [`SpoolError::Configuration`].
    pub fn check(&self) -> Result<()> {
        Validate::validate(self)
            .map_err(|e| SpoolError::config(format!("invalid spool config: {e}")))?;

        if self.file_name_pattern_mode == PatternSyntax::Like {
            return Err(SpoolError::config(
                "file_name_pattern_mode must be GLOB or REGEX",
            ));
        }
        self.matcher()?;

        let charset = self.resolved_charset()?;
        if self.data_format.is_line_oriented() && !charset.is_ascii_compatible() {
            return Err(SpoolError::config(format!(
                "charset '{}' is not supported for line-oriented formats",
                self.charset
            )));
        }

        match (&self.file_post_processing, &self.archive_directory) {
            (PostProcessing::Archive, None) => {
                return Err(SpoolError::config(
                    "archive_directory is required when file_post_processing is ARCHIVE",
                ));
            }
            (PostProcessing::Archive, Some(dir)) if same_dir(dir, &self.files_directory) => {
                return Err(SpoolError::config(
                    "archive_directory must differ from files_directory",
                ));
            }
            _ => {}
        }
        if let Some(dir) = &self.error_directory {
            if same_dir(dir, &self.files_directory) {
                return Err(SpoolError::config(
                    "error_directory must differ from files_directory",
                ));
            }
        }

        self.data_format.check()
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    a.components().eq(b.components())
}

/// Order in which pending files are consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadOrder {
    /// Byte-wise by relative path
    #[default]
    Lexicographical,
    /// By last-modified time, ties broken by relative path
    Timestamp,
}

/// Disposition of a fully consumed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostProcessing {
    /// Leave the file in place
    #[default]
    None,
    /// Move the file under `archive_directory`, keeping its relative path
    Archive,
    /// Remove the file
    Delete,
}

/// Record format with per-format settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "format", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFormat {
    Text(TextConfig),
    Delimited(DelimitedConfig),
    Log(LogConfig),
    Json(JsonConfig),
    Xml(XmlConfig),
    Binary(BinaryConfig),
    WholeFile(WholeFileConfig),
}

impl Default for DataFormat {
    fn default() -> Self {
        Self::Text(TextConfig::default())
    }
}

impl DataFormat {
    /// Formats read line by line from the raw bytes.
    pub fn is_line_oriented(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Delimited(_) | Self::Log(_))
    }

    /// Format name as used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text(_) => "TEXT",
            Self::Delimited(_) => "DELIMITED",
            Self::Log(_) => "LOG",
            Self::Json(_) => "JSON",
            Self::Xml(_) => "XML",
            Self::Binary(_) => "BINARY",
            Self::WholeFile(_) => "WHOLE_FILE",
        }
    }

    fn check(&self) -> Result<()> {
        match self {
            Self::Text(text) => {
                if text.max_line_length == 0 {
                    return Err(SpoolError::config("max_line_length must be positive"));
                }
                if text.use_custom_delimiter && text.resolved_custom_delimiter().is_empty() {
                    return Err(SpoolError::config("custom_delimiter must not be empty"));
                }
                Ok(())
            }
            Self::Delimited(delimited) => delimited.check(),
            Self::Log(log) => log.check(),
            Self::Json(_) | Self::Xml(_) | Self::WholeFile(_) => Ok(()),
            Self::Binary(binary) => {
                if binary.max_data_size == 0 {
                    return Err(SpoolError::config("max_data_size must be positive"));
                }
                Ok(())
            }
        }
    }
}

/// TEXT: one record per line, `{ "text": <line> }`
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct TextConfig {
    /// Longer lines are truncated and flagged
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Split on `custom_delimiter` instead of newlines
    #[serde(default)]
    pub use_custom_delimiter: bool,

    /// Record separator; `\n`, `\r` and `\t` escapes are honoured
    #[serde(default = "default_custom_delimiter")]
    pub custom_delimiter: String,

    /// Keep the delimiter at the end of each record
    #[serde(default)]
    pub include_custom_delimiter: bool,
}

fn default_max_line_length() -> usize {
    1024
}

fn default_custom_delimiter() -> String {
    "\\n".to_string()
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            use_custom_delimiter: false,
            custom_delimiter: default_custom_delimiter(),
            include_custom_delimiter: false,
        }
    }
}

impl TextConfig {
    /// Delimiter with escapes resolved.
    pub fn resolved_custom_delimiter(&self) -> String {
        unescape(&self.custom_delimiter)
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Delimited dialect presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelimitedFormatType {
    /// Comma, double quote, no escape
    #[default]
    Csv,
    /// Tab, double quote, no escape
    Tdf,
    /// Configured delimiter, quote and escape characters
    Custom,
}

/// Header row handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderLine {
    /// First row names the columns; records are maps
    WithHeader,
    /// First row is skipped; records are lists
    IgnoreHeader,
    /// Every row is data; records are lists
    #[default]
    NoHeader,
}

/// DELIMITED settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct DelimitedConfig {
    #[serde(default)]
    pub delimiter_format_type: DelimitedFormatType,

    #[serde(default = "default_delimiter")]
    pub delimiter_character: char,

    #[serde(default = "default_quote")]
    pub quote_character: char,

    #[serde(default = "default_escape")]
    pub escape_character: char,

    #[serde(default)]
    pub enable_comments: bool,

    #[serde(default = "default_comment_marker")]
    pub comment_marker: char,

    #[serde(default)]
    pub header_line: HeaderLine,

    /// With WITH_HEADER, keep columns beyond the header under `extra_column_prefix`
    #[serde(default)]
    pub allow_extra_columns: bool,

    #[serde(default = "default_extra_prefix")]
    pub extra_column_prefix: String,

    #[serde(default = "default_true")]
    pub skip_empty_lines: bool,

    /// Turn fields equal to `null_constant` into nulls
    #[serde(default)]
    pub parse_nulls: bool,

    #[serde(default = "default_null_constant")]
    pub null_constant: String,

    /// Rows longer than this many characters become decode errors
    #[serde(default)]
    pub max_record_length: Option<usize>,
}

fn default_delimiter() -> char {
    ','
}

fn default_quote() -> char {
    '"'
}

fn default_escape() -> char {
    '\\'
}

fn default_comment_marker() -> char {
    '#'
}

fn default_extra_prefix() -> String {
    "_extra_".to_string()
}

fn default_null_constant() -> String {
    "\\N".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter_format_type: DelimitedFormatType::Csv,
            delimiter_character: default_delimiter(),
            quote_character: default_quote(),
            escape_character: default_escape(),
            enable_comments: false,
            comment_marker: default_comment_marker(),
            header_line: HeaderLine::NoHeader,
            allow_extra_columns: false,
            extra_column_prefix: default_extra_prefix(),
            skip_empty_lines: true,
            parse_nulls: false,
            null_constant: default_null_constant(),
            max_record_length: None,
        }
    }
}

impl DelimitedConfig {
    /// Effective `(delimiter, quote, escape)` after applying the preset.
    pub fn dialect(&self) -> (char, Option<char>, Option<char>) {
        match self.delimiter_format_type {
            DelimitedFormatType::Csv => (',', Some('"'), None),
            DelimitedFormatType::Tdf => ('\t', Some('"'), None),
            DelimitedFormatType::Custom => (
                self.delimiter_character,
                Some(self.quote_character),
                Some(self.escape_character),
            ),
        }
    }

    fn check(&self) -> Result<()> {
        let (delimiter, quote, escape) = self.dialect();
        if quote == Some(delimiter) || escape == Some(delimiter) {
            return Err(SpoolError::config(
                "delimiter must differ from quote and escape characters",
            ));
        }
        if matches!(delimiter, '\n' | '\r') {
            return Err(SpoolError::config("delimiter cannot be a line terminator"));
        }
        if self.allow_extra_columns && self.extra_column_prefix.is_empty() {
            return Err(SpoolError::config("extra_column_prefix must not be empty"));
        }
        Ok(())
    }
}

/// Predefined and custom log layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogFormat {
    /// User regex with field path mapping
    #[default]
    Regex,
    /// Apache common log format
    CommonLogFormat,
    /// Apache combined log format
    CombinedLogFormat,
}

/// Maps a regex capture group to an output field path
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct FieldPathToGroup {
    pub field_path: String,
    pub group: usize,
}

/// LOG settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub log_format: LogFormat,

    /// Expression for REGEX; applied unanchored to each line
    #[serde(default)]
    pub regex: Option<String>,

    /// Output paths per group; empty uses named groups as `/<name>`
    #[serde(default)]
    pub field_path_to_group: Vec<FieldPathToGroup>,

    /// Add the raw line under `/originalLine`
    #[serde(default)]
    pub retain_original_line: bool,

    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Regex,
            regex: None,
            field_path_to_group: Vec::new(),
            retain_original_line: false,
            max_line_length: default_max_line_length(),
        }
    }
}

impl LogConfig {
    fn check(&self) -> Result<()> {
        if self.log_format != LogFormat::Regex {
            return Ok(());
        }
        let pattern = self
            .regex
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| SpoolError::config("regex is required for log_format REGEX"))?;
        let regex = regex::Regex::new(pattern)
            .map_err(|e| SpoolError::config(format!("invalid log regex: {e}")))?;

        if self.field_path_to_group.is_empty() && regex.capture_names().flatten().next().is_none() {
            return Err(SpoolError::config(
                "field_path_to_group is required when the regex has no named groups",
            ));
        }
        for mapping in &self.field_path_to_group {
            if mapping.group == 0 || mapping.group >= regex.captures_len() {
                return Err(SpoolError::config(format!(
                    "group {} for '{}' does not exist in the regex",
                    mapping.group, mapping.field_path
                )));
            }
        }
        Ok(())
    }
}

/// Layout of JSON content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JsonContent {
    /// Concatenated (usually newline-separated) objects
    #[default]
    MultipleObjects,
    /// One top-level array; each element is a record
    ArrayObjects,
}

/// JSON settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct JsonConfig {
    #[serde(default)]
    pub json_content: JsonContent,

    /// Larger objects become decode errors
    #[serde(default)]
    pub max_object_length: Option<usize>,
}

/// XML settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct XmlConfig {
    /// Element that delimits records; empty makes the whole document one record
    #[serde(default)]
    pub delimiter_element: Option<String>,
}

/// BINARY settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct BinaryConfig {
    /// Files larger than this fail as a whole
    #[serde(default = "default_max_data_size")]
    pub max_data_size: u64,
}

fn default_max_data_size() -> u64 {
    1024 * 1024
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            max_data_size: default_max_data_size(),
        }
    }
}

/// WHOLE_FILE has no settings; records reference the file instead of its content.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct WholeFileConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SpoolConfig::new("/in");
        assert_eq!(config.read_order, ReadOrder::Lexicographical);
        assert_eq!(config.file_post_processing, PostProcessing::None);
        assert_eq!(config.batch_size_in_recs, 1000);
        assert!(matches!(config.data_format, DataFormat::Text(_)));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
files_directory: /data/in
file_name_pattern: "^p(.*)([0-9]{1})(\\.txt)"
file_name_pattern_mode: REGEX
read_order: TIMESTAMP
file_post_processing: ARCHIVE
archive_directory: /data/archive
archive_retention_time_in_mins: 1
batch_size_in_recs: 3
charset: Big5
data_format:
  format: DELIMITED
  delimiter_format_type: CUSTOM
  delimiter_character: "^"
  header_line: WITH_HEADER
  allow_extra_columns: true
"#;
        let config: SpoolConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.file_name_pattern_mode, PatternSyntax::Regex);
        assert_eq!(config.read_order, ReadOrder::Timestamp);
        assert_eq!(config.archive_retention(), Some(Duration::from_secs(60)));
        let DataFormat::Delimited(delimited) = &config.data_format else {
            panic!("expected delimited format");
        };
        assert_eq!(delimited.dialect(), ('^', Some('"'), Some('\\')));
        assert_eq!(delimited.header_line, HeaderLine::WithHeader);
        config.check().unwrap();
    }

    #[test]
    fn test_invalid_regex_is_configuration_error() {
        let mut config = SpoolConfig::new("/in");
        config.file_name_pattern = "([unclosed".into();
        config.file_name_pattern_mode = PatternSyntax::Regex;
        assert!(matches!(config.check(), Err(SpoolError::Configuration(_))));
    }

    #[test]
    fn test_archive_requires_directory() {
        let mut config = SpoolConfig::new("/in");
        config.file_post_processing = PostProcessing::Archive;
        assert!(config.check().is_err());
        config.archive_directory = Some("/in".into());
        assert!(config.check().is_err());
        config.archive_directory = Some("/archive".into());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_batch_size_range() {
        let mut config = SpoolConfig::new("/in");
        config.batch_size_in_recs = 0;
        assert!(config.check().is_err());
        config.batch_size_in_recs = 1;
        config.max_pending_batches = 3;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_unknown_charset() {
        let mut config = SpoolConfig::new("/in");
        config.charset = "klingon".into();
        assert!(config.check().is_err());
        config.charset = "UTF-16LE".into();
        assert!(config.check().is_err(), "UTF-16 is not line friendly");
        config.data_format = DataFormat::Json(JsonConfig::default());
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_log_regex_mapping_checked() {
        let mut log = LogConfig {
            regex: Some(r"(\S+) (\S+)".into()),
            ..Default::default()
        };
        assert!(log.check().is_err(), "no mapping and no named groups");

        log.field_path_to_group = vec![FieldPathToGroup {
            field_path: "/date".into(),
            group: 3,
        }];
        assert!(log.check().is_err(), "group 3 does not exist");

        log.field_path_to_group[0].group = 1;
        assert!(log.check().is_ok());

        let named = LogConfig {
            regex: Some(r"(?P<level>\w+)".into()),
            ..Default::default()
        };
        assert!(named.check().is_ok());
    }

    #[test]
    fn test_custom_delimiter_unescaped() {
        let text = TextConfig {
            use_custom_delimiter: true,
            custom_delimiter: "\\r\\n".into(),
            ..Default::default()
        };
        assert_eq!(text.resolved_custom_delimiter(), "\r\n");
    }

    #[test]
    fn test_presets_override_characters() {
        let delimited = DelimitedConfig {
            delimiter_character: '^',
            ..Default::default()
        };
        assert_eq!(delimited.dialect(), (',', Some('"'), None));
    }
}
