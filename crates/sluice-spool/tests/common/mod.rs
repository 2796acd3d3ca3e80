//! Shared helpers for spool integration tests

#![allow(dead_code)]

use anyhow::Result;
use sluice_core::{BatchSource, Record};
use sluice_spool::{DataFormat, DirectorySource, SpoolConfig, TextConfig};
use std::fs;
use std::path::Path;
use std::sync::Once;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initialize tracing for tests (call once at start of test)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sluice_spool=debug")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Text spool over `root/in` with short timings.
pub fn text_config(root: &Path) -> SpoolConfig {
    let mut config = SpoolConfig::new(root.join("in"));
    config.spooling_period_secs = 1;
    config.batch_wait_time_secs = 1;
    config.stop_grace_period_secs = 2;
    config.data_format = DataFormat::Text(TextConfig::default());
    config
}

pub fn write_file(dir: &Path, relative: &str, content: impl AsRef<[u8]>) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Records and error count gathered by [`collect`].
#[derive(Debug, Default)]
pub struct Collected {
    pub records: Vec<Record>,
    pub errors: usize,
    pub batch_sizes: Vec<usize>,
}

impl Collected {
    pub fn texts(&self, path: &str) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| r.get_str(path).map(str::to_string))
            .collect()
    }
}

/// Poll and acknowledge until `expected` records arrived or `timeout` passed.
pub async fn collect(
    source: &mut DirectorySource,
    expected: usize,
    timeout: Duration,
) -> Result<Collected> {
    let mut collected = Collected::default();
    let deadline = Instant::now() + timeout;
    while collected.records.len() < expected && Instant::now() < deadline {
        let Some(batch) = source.poll_next_batch(Duration::from_millis(200)).await? else {
            continue;
        };
        if !batch.is_empty() {
            collected.batch_sizes.push(batch.records.len());
        }
        collected.errors += batch.errors.len();
        collected.records.extend(batch.records.iter().cloned());
        source.acknowledge(batch.id).await?;
    }
    Ok(collected)
}

/// Poll for `window` and return how many records showed up.
pub async fn quiet_for(source: &mut DirectorySource, window: Duration) -> Result<usize> {
    Ok(collect(source, usize::MAX, window).await?.records.len())
}
