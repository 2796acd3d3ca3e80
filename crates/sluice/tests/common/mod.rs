//! Shared helpers for runner tests

#![allow(dead_code)]

use sluice::{JsonLinesSink, SinkConfig};
use std::fs;
use std::path::Path;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize tracing for tests (call once at start of test)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sluice=debug")),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn write_file(dir: &Path, relative: &str, content: impl AsRef<[u8]>) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

pub fn memory_sink(config: SinkConfig) -> JsonLinesSink<Vec<u8>> {
    JsonLinesSink::new(Vec::new(), config)
}

/// Parse what a sink wrote, one JSON value per line.
pub fn lines(sink: JsonLinesSink<Vec<u8>>) -> Vec<serde_json::Value> {
    String::from_utf8(sink.into_inner())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
