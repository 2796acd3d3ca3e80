//! Record representation
//!
//! A [`Record`] is a tree of [`Field`]s plus a [`Header`] of string metadata.
//! Decoders build records, batches own them, and nothing mutates a record
//! after it has been handed downstream.
//!
//! ## Field paths
//!
//! Fields are addressed with `/`-separated paths. Map children are addressed
//! by key, list children by index:
//!
//! ```rust
//! use sluice_core::{Field, Record};
//!
//! let root = Field::list(vec![Field::string("a"), Field::string("b")]);
//! let record = Record::new("spool::data.csv::0", root);
//! assert_eq!(record.get("/1").and_then(Field::as_str), Some("b"));
//! ```

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value held by a field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Value {
    /// SQL / JSON null
    #[default]
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    /// Exact decimal kept in its textual form
    Decimal(String),
    String(String),
    Bytes(Bytes),
    List(Vec<Field>),
    /// Ordered map; iteration follows insertion order
    Map(IndexMap<String, Field>),
}

/// A typed value plus optional string attributes (e.g. decimal precision).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Field {
    pub value: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Field {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            attributes: BTreeMap::new(),
        }
    }

    pub fn null() -> Self {
        Self::new(Value::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(Value::String(s.into()))
    }

    pub fn long(v: i64) -> Self {
        Self::new(Value::Long(v))
    }

    pub fn double(v: f64) -> Self {
        Self::new(Value::Double(v))
    }

    pub fn boolean(v: bool) -> Self {
        Self::new(Value::Boolean(v))
    }

    pub fn bytes(b: impl Into<Bytes>) -> Self {
        Self::new(Value::Bytes(b.into()))
    }

    /// Decimal field carrying `precision` and `scale` attributes.
    pub fn decimal(v: impl Into<String>, precision: u32, scale: u32) -> Self {
        Self::new(Value::Decimal(v.into()))
            .with_attribute("precision", precision.to_string())
            .with_attribute("scale", scale.to_string())
    }

    pub fn list(items: Vec<Field>) -> Self {
        Self::new(Value::List(items))
    }

    pub fn map(entries: IndexMap<String, Field>) -> Self {
        Self::new(Value::Map(entries))
    }

    /// Build a map field from `(key, field)` pairs, keeping their order.
    pub fn map_from<K: Into<String>>(entries: impl IntoIterator<Item = (K, Field)>) -> Self {
        Self::map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    /// String content, if this is a string field.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Field]> {
        match &self.value {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Field>> {
        match &self.value {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Resolve a `/`-separated path. `""` and `"/"` resolve to `self`.
    pub fn get(&self, path: &str) -> Option<&Field> {
        let mut current = self;
        for segment in path_segments(path) {
            current = match &current.value {
                Value::Map(entries) => entries.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Insert `field` at `path`, creating intermediate maps as needed.
    ///
    /// Returns `false` when an intermediate segment exists but is not a map,
    /// or when the path is empty.
    pub fn insert(&mut self, path: &str, field: Field) -> bool {
        let segments: Vec<&str> = path_segments(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            return false;
        };

        let mut current = self;
        for segment in parents {
            if current.is_null() {
                current.value = Value::Map(IndexMap::new());
            }
            let Value::Map(entries) = &mut current.value else {
                return false;
            };
            current = entries
                .entry((*segment).to_string())
                .or_insert_with(|| Field::map(IndexMap::new()));
        }

        if current.is_null() {
            current.value = Value::Map(IndexMap::new());
        }
        match &mut current.value {
            Value::Map(entries) => {
                entries.insert((*last).to_string(), field);
                true
            }
            _ => false,
        }
    }

    /// Plain JSON rendering without type tags or attributes.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match &self.value {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Long(v) => Json::from(*v),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Decimal(s) | Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Value::List(items) => Json::Array(items.iter().map(Field::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::string(s)
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::string(s)
    }
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// String-keyed record metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header {
    /// Unique id of the record within its source (e.g. `file::offset`)
    pub source_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Header {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

/// A decoded record: header plus a field tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    pub header: Header,
    pub root: Field,
}

impl Record {
    pub fn new(source_id: impl Into<String>, root: Field) -> Self {
        Self {
            header: Header::new(source_id),
            root,
        }
    }

    /// Add a header attribute.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.set(key, value);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.header.get(key)
    }

    pub fn get(&self, path: &str) -> Option<&Field> {
        self.root.get(path)
    }

    /// String at `path`, if present and a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Field::as_str)
    }

    /// `{ "header": {...}, "value": ... }` rendering used by the CLI sink.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "header": {
                "sourceId": self.header.source_id,
                "attributes": self.header.attributes,
            },
            "value": self.root.to_json(),
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_get_by_path() {
        let root = Field::map_from([
            ("text", Field::string("hello")),
            (
                "nested",
                Field::map_from([("items", Field::list(vec![Field::long(1), Field::long(2)]))]),
            ),
        ]);
        let record = Record::new("src::0", root);

        assert_eq!(record.get_str("/text"), Some("hello"));
        assert_eq!(record.get("/nested/items/1"), Some(&Field::long(2)));
        assert!(record.get("/nested/items/5").is_none());
        assert!(record.get("/text/deeper").is_none());
        assert_eq!(record.get("/"), Some(&record.root));
    }

    #[test]
    fn test_insert_creates_intermediate_maps() {
        let mut root = Field::null();
        assert!(root.insert("/date", Field::string("2019-04-30")));
        assert!(root.insert("/meta/level", Field::string("INFO")));

        assert_eq!(root.get("/date").and_then(Field::as_str), Some("2019-04-30"));
        assert_eq!(root.get("/meta/level").and_then(Field::as_str), Some("INFO"));
        assert!(!root.insert("/date/x", Field::null()));
        assert!(!root.insert("", Field::null()));
    }

    #[test]
    fn test_string_null_distinct_from_null() {
        let literal = Field::string("NULL");
        let sql_null = Field::null();
        assert_ne!(literal, sql_null);
        assert_eq!(literal.to_json(), serde_json::json!("NULL"));
        assert_eq!(sql_null.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_decimal_attributes() {
        let field = Field::decimal("12.50", 20, 2);
        assert_eq!(field.attribute("precision"), Some("20"));
        assert_eq!(field.attribute("scale"), Some("2"));
        assert_eq!(field.to_json(), serde_json::json!("12.50"));
    }

    #[test]
    fn test_map_order_preserved_in_json() {
        let root = Field::map_from([
            ("columnA", Field::string("1")),
            ("columnB", Field::string("2")),
            ("_extra_01", Field::string("3")),
        ]);
        let json = serde_json::to_string(&root.to_json()).unwrap();
        assert_eq!(json, r#"{"columnA":"1","columnB":"2","_extra_01":"3"}"#);
    }

    #[test]
    fn test_record_serde_roundtrip_keeps_types() {
        let record = Record::new(
            "cdc::1",
            Field::map_from([
                ("ID", Field::decimal("1", 10, 0)),
                ("NAME", Field::string("MORDOR")),
                ("RAW", Field::bytes(vec![1u8, 2, 3])),
            ]),
        )
        .with_header("cdc.operation", "INSERT");

        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
