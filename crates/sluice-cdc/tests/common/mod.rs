//! Shared helpers for CDC integration tests

#![allow(dead_code)]

use anyhow::Result;
use sluice_cdc::{
    CdcConfig, CdcSource, ColumnValue, LogSourceConfig, MemoryLog, StartPosition, TableSelector,
};
use sluice_core::{BatchSource, ErrorRecord, Record};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initialize tracing for tests (call once at start of test)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sluice_cdc=debug")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const SCHEMA: &str = "SYS";
pub const TABLE: &str = "LOCATIONS";

/// Config capturing `SYS.LOCATIONS` from the first log position, with short timings.
pub fn config() -> CdcConfig {
    let mut config = CdcConfig::new(
        vec![TableSelector::new(SCHEMA, TABLE)],
        LogSourceConfig::Directory {
            path: PathBuf::from("/unused"),
        },
    );
    config.start_position = StartPosition::Position { position: 1 };
    config.batch_wait_time_ms = 100;
    config.poll_interval_ms = 10;
    config.stop_grace_period_secs = 2;
    config
}

pub fn source(log: &MemoryLog, config: CdcConfig) -> CdcSource {
    CdcSource::new("cdc", config).with_log(Arc::new(log.clone()))
}

pub fn row(id: i64, name: &str) -> Vec<ColumnValue> {
    vec![ColumnValue::new("ID", id), ColumnValue::new("NAME", name)]
}

/// Records and errors gathered by [`collect`].
#[derive(Debug, Default)]
pub struct Collected {
    pub records: Vec<Record>,
    pub errors: Vec<ErrorRecord>,
    pub batch_sizes: Vec<usize>,
}

impl Collected {
    pub fn texts(&self, path: &str) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| r.get_str(path).map(str::to_string))
            .collect()
    }

    pub fn headers(&self, key: &str) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| r.header(key).map(str::to_string))
            .collect()
    }
}

/// Poll and acknowledge until `expected` records arrived or `timeout` passed.
pub async fn collect(
    source: &mut CdcSource,
    expected: usize,
    timeout: Duration,
) -> Result<Collected> {
    let mut collected = Collected::default();
    let deadline = Instant::now() + timeout;
    while collected.records.len() < expected && Instant::now() < deadline {
        let Some(batch) = source.poll_next_batch(Duration::from_millis(100)).await? else {
            continue;
        };
        collected.batch_sizes.push(batch.records.len());
        collected.errors.extend(batch.errors.iter().cloned());
        collected.records.extend(batch.records.iter().cloned());
        source.acknowledge(batch.id).await?;
    }
    Ok(collected)
}

/// Poll for `window` and return how many records arrived.
pub async fn quiet_for(source: &mut CdcSource, window: Duration) -> Result<usize> {
    let collected = collect(source, usize::MAX, window).await?;
    Ok(collected.records.len())
}
