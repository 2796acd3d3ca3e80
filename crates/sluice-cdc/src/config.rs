//! Configuration for the CDC source
//!
//! # Example
//!
//! ```yaml
//! tables:
//!   - schema: SALES
//!     table: "ORDERS_%"
//!     exclude_pattern: "%_ARCHIVE"
//! start_position:
//!   kind: DATE
//!   date: "01-03-2024 00:00:00"
//! buffer_locally: false
//! spill_directory: /var/lib/sluice/spill
//! overflow_policy: FLUSH
//! log:
//!   kind: DIRECTORY
//!   path: /var/lib/redo
//! ```

use crate::error::{CdcError, Result};
use crate::filter::TableFilter;
use chrono::{DateTime, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Format of `start_position.date`
pub const START_DATE_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// CDC source configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct CdcConfig {
    /// Tables to capture
    #[validate(length(min = 1))]
    pub tables: Vec<TableSelector>,

    /// Where to start reading when no cursor is stored
    #[serde(default)]
    pub start_position: StartPosition,

    /// Keep open transactions in memory; false spills them to disk
    #[serde(default = "default_true")]
    pub buffer_locally: bool,

    /// Spill directory for `buffer_locally: false`; defaults to the system temp dir
    #[serde(default)]
    pub spill_directory: Option<PathBuf>,

    /// Log-time age after which an open transaction overflows (seconds)
    #[serde(default = "default_max_transaction_length")]
    #[validate(range(min = 1))]
    pub max_transaction_length_secs: u64,

    /// Event-count bound per transaction
    #[serde(default = "default_max_transaction_events")]
    #[validate(range(min = 1))]
    pub max_transaction_events: usize,

    /// What to do with an overflowing transaction
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Log-time span covered by one mining session (seconds)
    #[serde(default = "default_session_window")]
    #[validate(range(min = 1))]
    pub session_window_secs: u64,

    /// Maximum events per batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000000))]
    pub max_batch_size_in_records: usize,

    /// Maximum time a partially filled batch waits (milliseconds)
    #[serde(default = "default_batch_wait_ms")]
    #[validate(range(min = 1, max = 3600000))]
    pub batch_wait_time_ms: u64,

    /// Hold committed transactions until every earlier-started transaction resolved
    #[serde(default)]
    pub strict_low_water_emission: bool,

    /// Depth of the hand-off queue
    #[serde(default = "default_pending_batches")]
    #[validate(range(min = 1, max = 2))]
    pub max_pending_batches: usize,

    /// Directory for the durable cursor; unset keeps it in memory
    #[serde(default)]
    pub offset_directory: Option<PathBuf>,

    /// Idle wait between log polls once caught up (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub poll_interval_ms: u64,

    /// Grace period for the log reader on stop (seconds)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_period_secs: u64,

    /// Transaction log to read
    pub log: LogSourceConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_transaction_length() -> u64 {
    3600
}

fn default_max_transaction_events() -> usize {
    100_000
}

fn default_session_window() -> u64 {
    600
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_wait_ms() -> u64 {
    1000
}

fn default_pending_batches() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_grace() -> u64 {
    10
}

impl CdcConfig {
    /// Configuration with defaults for everything but the tables and the log.
    pub fn new(tables: Vec<TableSelector>, log: LogSourceConfig) -> Self {
        Self {
            tables,
            start_position: StartPosition::default(),
            buffer_locally: true,
            spill_directory: None,
            max_transaction_length_secs: default_max_transaction_length(),
            max_transaction_events: default_max_transaction_events(),
            overflow_policy: OverflowPolicy::default(),
            session_window_secs: default_session_window(),
            max_batch_size_in_records: default_batch_size(),
            batch_wait_time_ms: default_batch_wait_ms(),
            strict_low_water_emission: false,
            max_pending_batches: default_pending_batches(),
            offset_directory: None,
            poll_interval_ms: default_poll_interval_ms(),
            stop_grace_period_secs: default_stop_grace(),
            log,
        }
    }

    pub fn max_transaction_length(&self) -> Duration {
        Duration::from_secs(self.max_transaction_length_secs)
    }

    pub fn session_window(&self) -> Duration {
        Duration::from_secs(self.session_window_secs)
    }

    /// `max_transaction_length` in log time.
    pub fn max_transaction_duration(&self) -> Result<chrono::Duration> {
        log_time("max_transaction_length_secs", self.max_transaction_length())
    }

    /// `session_window` in log time.
    pub fn session_duration(&self) -> Result<chrono::Duration> {
        log_time("session_window_secs", self.session_window())
    }

    pub fn batch_wait_time(&self) -> Duration {
        Duration::from_millis(self.batch_wait_time_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Spill directory, falling back to the system temp dir.
    pub fn resolved_spill_directory(&self) -> PathBuf {
        self.spill_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sluice-spill"))
    }

    /// Full validation: field rules plus cross-field checks.
    pub fn check(&self) -> Result<()> {
        Validate::validate(self)
            .map_err(|e| CdcError::config(format!("invalid cdc config: {e}")))?;
        TableFilter::new(&self.tables)?;
        self.start_position.check()?;
        self.max_transaction_duration()?;
        self.session_duration()?;
        match &self.log {
            LogSourceConfig::Directory { path } if path.as_os_str().is_empty() => {
                Err(CdcError::config("log.path must not be empty"))
            }
            LogSourceConfig::Directory { .. } => Ok(()),
        }
    }
}

/// One captured table selection; names are SQL LIKE patterns, case-insensitive
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TableSelector {
    pub schema: String,
    pub table: String,
    /// Tables matching this pattern are skipped even if `table` matches
    #[serde(default)]
    pub exclude_pattern: Option<String>,
}

impl TableSelector {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            exclude_pattern: None,
        }
    }

    pub fn excluding(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_pattern = Some(pattern.into());
        self
    }
}

/// Initial log position
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartPosition {
    /// Only changes appended after start
    #[default]
    Latest,
    /// Changes logged at or after `date` (`dd-mm-YYYY HH:MM:SS`, UTC)
    Date { date: String },
    /// Changes at or after a log position
    Position { position: u64 },
}

impl StartPosition {
    fn check(&self) -> Result<()> {
        if let Self::Date { date } = self {
            parse_start_date(date)?;
        }
        Ok(())
    }
}

fn log_time(field: &str, duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .ok()
        // log timestamps must stay representable after adding it
        .filter(|d| Utc::now().checked_add_signed(*d).is_some())
        .ok_or_else(|| CdcError::config(format!("{field} is out of range")))
}

/// Parse a `start_position.date` value.
pub fn parse_start_date(date: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(date.trim(), START_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            CdcError::config(format!(
                "start date '{date}' does not match dd-mm-YYYY HH:MM:SS: {e}"
            ))
        })
}

/// Resolution of an overflowing transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverflowPolicy {
    /// Drop the pending events
    #[default]
    Discard,
    /// Emit the pending events as if committed, flagged `cdc.forced`
    Flush,
}

/// Transaction log location
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSourceConfig {
    /// Numbered JSON-lines segments `<seq>.jsonl`
    Directory { path: PathBuf },
}
