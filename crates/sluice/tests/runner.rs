//! Runner tests against real sources
//!
//! Run with: cargo test -p sluice --test runner -- --nocapture

mod common;

use common::{init_test_logging, lines, memory_sink, write_file};
use pretty_assertions::assert_eq;
use sluice::{run_source, Engine, RunSettings, SinkConfig, SluiceConfig};
use sluice_cdc::{
    CdcConfig, CdcSource, ColumnValue, LogOp, LogSourceConfig, MemoryLog, StartPosition,
    TableSelector,
};
use sluice_spool::{DirectorySource, SpoolConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;

fn spool_config(root: &Path) -> anyhow::Result<SpoolConfig> {
    let yaml = format!(
        r#"
name: incoming
spool:
  files_directory: {in_dir}
  file_name_pattern: "*.txt"
  spooling_period_secs: 1
  batch_wait_time_secs: 1
  stop_grace_period_secs: 2
  offset_directory: {offsets}
  data_format:
    format: TEXT
run:
  poll_timeout_ms: 5000
  stop_when_idle: true
"#,
        in_dir = root.join("in").display(),
        offsets = root.join("offsets").display(),
    );
    match SluiceConfig::from_yaml(&yaml)?.engine()? {
        Engine::Spool(spool) => Ok(spool),
        Engine::Cdc(_) => anyhow::bail!("expected a spool config"),
    }
}

fn until_idle() -> RunSettings {
    RunSettings {
        poll_timeout_ms: 5000,
        max_batches: None,
        stop_when_idle: true,
    }
}

#[tokio::test]
async fn test_spool_drains_and_resumes() -> anyhow::Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    write_file(root.path(), "in/a.txt", "one\ntwo\n");
    write_file(root.path(), "in/b.txt", "three\n");
    let config = spool_config(root.path())?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut source = DirectorySource::new("incoming", config.clone());
    let mut sink = memory_sink(SinkConfig::default());
    let summary = run_source(&mut source, &mut sink, &until_idle(), shutdown_rx.clone()).await?;
    assert_eq!(summary.records, 3);
    assert_eq!(summary.errors, 0);
    assert!(!source.is_running());

    let written = lines(sink);
    let texts: Vec<&str> = written
        .iter()
        .filter_map(|l| l["value"]["text"].as_str())
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    assert_eq!(written[2]["header"]["attributes"]["filename"], "b.txt");

    // Same name, same offset directory: nothing left to read.
    let mut again = DirectorySource::new("incoming", config);
    let mut sink = memory_sink(SinkConfig::default());
    let summary = run_source(&mut again, &mut sink, &until_idle(), shutdown_rx).await?;
    assert_eq!(summary.records, 0);
    assert!(lines(sink).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_before_first_batch() -> anyhow::Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    write_file(root.path(), "in/a.txt", "one\n");
    let config = spool_config(root.path())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    shutdown_tx.send(true)?;

    let mut source = DirectorySource::new("incoming", config);
    let mut sink = memory_sink(SinkConfig::default());
    let summary = run_source(&mut source, &mut sink, &until_idle(), shutdown_rx).await?;
    assert_eq!(summary.batches, 0);
    assert!(!source.is_running());
    Ok(())
}

#[tokio::test]
async fn test_start_failure_is_reported() -> anyhow::Result<()> {
    init_test_logging();
    let root = TempDir::new()?;
    let config = SpoolConfig::new(root.path().join("missing"));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut source = DirectorySource::new("incoming", config);
    let mut sink = memory_sink(SinkConfig::default());
    let err = run_source(&mut source, &mut sink, &until_idle(), shutdown_rx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Failed to start source"));
    Ok(())
}

#[tokio::test]
async fn test_cdc_batch_limit() -> anyhow::Result<()> {
    init_test_logging();
    let log = MemoryLog::new();
    for (txn, id) in [("t1", 1), ("t2", 2), ("t3", 3)] {
        log.append(
            txn,
            LogOp::insert(
                "SALES",
                "ORDERS",
                vec![ColumnValue::new("ID", id), ColumnValue::new("NOTE", "NULL")],
            ),
        );
        log.append(txn, LogOp::Commit);
    }

    let mut config = CdcConfig::new(
        vec![TableSelector::new("SALES", "ORDERS")],
        LogSourceConfig::Directory {
            path: PathBuf::from("/unused"),
        },
    );
    config.start_position = StartPosition::Position { position: 1 };
    config.max_batch_size_in_records = 1;
    config.batch_wait_time_ms = 100;
    config.poll_interval_ms = 10;
    config.stop_grace_period_secs = 2;
    let mut source = CdcSource::new("orders", config).with_log(Arc::new(log.clone()));

    let settings = RunSettings {
        poll_timeout_ms: 5000,
        max_batches: Some(2),
        stop_when_idle: false,
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sink = memory_sink(SinkConfig::default());
    let summary = run_source(&mut source, &mut sink, &settings, shutdown_rx).await?;
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.records, 2);

    let written = lines(sink);
    let ids: Vec<i64> = written
        .iter()
        .filter_map(|l| l["value"]["ID"].as_i64())
        .collect();
    assert_eq!(ids, vec![1, 2]);
    // The string "NULL" stays a string.
    assert_eq!(written[0]["value"]["NOTE"], "NULL");
    Ok(())
}
