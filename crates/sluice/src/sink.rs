//! JSON-lines output
//!
//! Every good record is written as `{"header": ..., "value": ...}`. Error
//! records, when enabled, are written as `{"error": {...}, "record": ...}`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sluice_core::{Batch, ErrorRecord};
use std::io::{self, Write};

/// Sink configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SinkConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Also write error records
    #[serde(default = "default_true")]
    pub include_errors: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::default(),
            include_errors: true,
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Compact JSON, one record per line
    #[default]
    Json,
    /// Pretty-printed JSON
    Pretty,
}

/// Writes batches as JSON.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    config: SinkConfig,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout(config: SinkConfig) -> Self {
        Self::new(io::stdout(), config)
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W, config: SinkConfig) -> Self {
        Self { writer, config }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write a batch; returns the number of lines written.
    pub fn write_batch(&mut self, batch: &Batch) -> io::Result<usize> {
        let mut lines = 0;
        for record in &batch.records {
            self.write_value(&record.to_json())?;
            lines += 1;
        }
        if self.config.include_errors {
            for error in &batch.errors {
                self.write_value(&error_json(error))?;
                lines += 1;
            }
        }
        self.writer.flush()?;
        Ok(lines)
    }

    fn write_value(&mut self, value: &serde_json::Value) -> io::Result<()> {
        match self.config.format {
            OutputFormat::Json => serde_json::to_writer(&mut self.writer, value)?,
            OutputFormat::Pretty => serde_json::to_writer_pretty(&mut self.writer, value)?,
        }
        self.writer.write_all(b"\n")
    }
}

fn error_json(error: &ErrorRecord) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "code": error.error_code,
            "message": error.message,
        },
        "record": error.record.to_json(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sluice_core::{BatchId, Field, Record};

    fn batch() -> Batch {
        let mut batch = Batch::new(BatchId::new(1));
        batch.records.push(
            Record::new("a.txt::0", Field::map_from([("text", Field::string("hello"))]))
                .with_header("filename", "a.txt"),
        );
        batch.errors.push(ErrorRecord::new(
            Record::new("a.txt::6", Field::string("bad")),
            "DECODE_ERROR",
            "broken",
        ));
        batch
    }

    #[test]
    fn test_json_lines() {
        let mut sink = JsonLinesSink::new(Vec::new(), SinkConfig::default());
        assert_eq!(sink.write_batch(&batch()).unwrap(), 2);
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["value"]["text"], "hello");
        assert_eq!(lines[0]["header"]["attributes"]["filename"], "a.txt");
        assert_eq!(lines[1]["error"]["code"], "DECODE_ERROR");
    }

    #[test]
    fn test_errors_can_be_suppressed() {
        let config = SinkConfig {
            include_errors: false,
            ..SinkConfig::default()
        };
        let mut sink = JsonLinesSink::new(Vec::new(), config);
        assert_eq!(sink.write_batch(&batch()).unwrap(), 1);
    }
}
