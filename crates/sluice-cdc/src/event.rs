//! Log records and change events
//!
//! A [`LogRecord`] is one entry of the transaction log as JSON:
//!
//! ```json
//! {"position": 7, "timestamp": "2024-03-01T10:00:00Z", "txn_id": "0a.11.2f",
//!  "kind": "DML", "schema": "SALES", "table": "ORDERS", "op": "UPDATE",
//!  "columns": [{"name": "ID", "value": 1}, {"name": "NOTE", "value": null}]}
//! ```
//!
//! Columns absent from `columns` were not touched by the statement and stay
//! absent from the emitted record. `null` is SQL NULL; the string `"NULL"` is
//! just a string.
//!
//! A [`ChangeEvent`] is a row change whose transaction committed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sluice_core::{Field, Record};

pub const HEADER_SDC_OPERATION: &str = "sdc.operation.type";
pub const HEADER_OPERATION: &str = "cdc.operation";
pub const HEADER_SCHEMA: &str = "cdc.schema";
pub const HEADER_TABLE: &str = "cdc.table";
pub const HEADER_TXN_ID: &str = "cdc.txn.id";
pub const HEADER_COMMIT_TIMESTAMP: &str = "cdc.commit.timestamp";
pub const HEADER_POSITION: &str = "cdc.position";
pub const HEADER_FORCED: &str = "cdc.forced";

/// Row operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Numeric operation code carried in `sdc.operation.type`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "1",
            Self::Delete => "2",
            Self::Update => "3",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One column of a row image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    pub name: String,
    #[serde(default)]
    pub value: Json,
    /// Set for DECIMAL/NUMBER columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
}

impl ColumnValue {
    pub fn new(name: impl Into<String>, value: impl Into<Json>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            precision: None,
            scale: None,
        }
    }

    /// SQL NULL
    pub fn null(name: impl Into<String>) -> Self {
        Self::new(name, Json::Null)
    }

    pub fn decimal(name: impl Into<String>, value: impl Into<String>, precision: u32, scale: u32) -> Self {
        Self {
            precision: Some(precision),
            scale: Some(scale),
            ..Self::new(name, Json::String(value.into()))
        }
    }

    pub fn to_field(&self) -> Field {
        match (&self.value, self.precision, self.scale) {
            (Json::Number(n), Some(p), Some(s)) => Field::decimal(n.to_string(), p, s),
            (Json::String(v), Some(p), Some(s)) => Field::decimal(v.clone(), p, s),
            (value, _, _) => json_field(value),
        }
    }
}

fn json_field(value: &Json) -> Field {
    match value {
        Json::Null => Field::null(),
        Json::Bool(b) => Field::boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Field::long(i),
            None => Field::double(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Field::string(s.clone()),
        Json::Array(items) => Field::list(items.iter().map(json_field).collect()),
        Json::Object(map) => Field::map_from(map.iter().map(|(k, v)| (k.clone(), json_field(v)))),
    }
}

/// A DML statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmlChange {
    pub schema: String,
    pub table: String,
    pub op: Operation,
    /// Row image of a single-row statement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnValue>,
    /// Row images of a multi-row statement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Vec<ColumnValue>>,
}

impl DmlChange {
    /// One row image per affected row.
    pub fn row_images(&self) -> Vec<&[ColumnValue]> {
        if self.rows.is_empty() {
            vec![self.columns.as_slice()]
        } else {
            self.rows.iter().map(Vec::as_slice).collect()
        }
    }
}

/// Log record payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogOp {
    Dml(DmlChange),
    Savepoint { name: String },
    RollbackTo { name: String },
    Commit,
    Rollback,
}

impl LogOp {
    fn dml(schema: &str, table: &str, op: Operation, columns: Vec<ColumnValue>) -> Self {
        Self::Dml(DmlChange {
            schema: schema.to_string(),
            table: table.to_string(),
            op,
            columns,
            rows: Vec::new(),
        })
    }

    pub fn insert(schema: &str, table: &str, columns: Vec<ColumnValue>) -> Self {
        Self::dml(schema, table, Operation::Insert, columns)
    }

    pub fn update(schema: &str, table: &str, columns: Vec<ColumnValue>) -> Self {
        Self::dml(schema, table, Operation::Update, columns)
    }

    pub fn delete(schema: &str, table: &str, columns: Vec<ColumnValue>) -> Self {
        Self::dml(schema, table, Operation::Delete, columns)
    }

    pub fn savepoint(name: impl Into<String>) -> Self {
        Self::Savepoint { name: name.into() }
    }

    pub fn rollback_to(name: impl Into<String>) -> Self {
        Self::RollbackTo { name: name.into() }
    }
}

/// One transaction log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Strictly increasing, starting at 1
    pub position: u64,
    pub timestamp: DateTime<Utc>,
    pub txn_id: String,
    #[serde(flatten)]
    pub op: LogOp,
}

/// Delivery key; delivery order is ascending key order.
///
/// Keys are derived from log positions only, so re-reading the log after a
/// restart yields the same keys for the same events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Log position of the COMMIT (or of the record that forced resolution)
    pub commit_position: u64,
    /// Position of the transaction's first record
    pub txn_start_position: u64,
    /// 1-based index within the transaction; 0 marks an overflow notice
    pub sequence: u64,
}

/// A committed row change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub operation: Operation,
    pub columns: Vec<ColumnValue>,
    pub txn_id: String,
    pub commit_timestamp: DateTime<Utc>,
    pub key: EventKey,
    /// Position of the DML record
    pub log_position: u64,
    /// Emitted by an overflow FLUSH rather than a COMMIT
    pub forced: bool,
}

impl ChangeEvent {
    pub fn to_record(&self) -> Record {
        let root = Field::map_from(self.columns.iter().map(|c| (c.name.clone(), c.to_field())));
        let mut record = Record::new(
            format!(
                "{}::{}::{}",
                self.txn_id, self.key.commit_position, self.key.sequence
            ),
            root,
        );
        let header = &mut record.header;
        header.set(HEADER_SDC_OPERATION, self.operation.code());
        header.set(HEADER_OPERATION, self.operation.as_str());
        header.set(HEADER_SCHEMA, self.schema.clone());
        header.set(HEADER_TABLE, self.table.clone());
        header.set(HEADER_TXN_ID, self.txn_id.clone());
        header.set(
            HEADER_COMMIT_TIMESTAMP,
            self.commit_timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        header.set(HEADER_POSITION, self.log_position.to_string());
        if self.forced {
            header.set(HEADER_FORCED, "true");
        }
        record
    }
}
