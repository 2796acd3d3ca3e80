//! JSON: concatenated objects or a single top-level array.

use super::{ByteReader, Decode, Decoded, FormatError};
use crate::charset::Charset;
use crate::config::{JsonConfig, JsonContent};
use serde_json::Value as Json;
use sluice_core::Field;

/// Convert a parsed JSON value into a field tree.
///
/// Integers outside the `i64` range become decimals so that no digits are lost.
pub fn json_to_field(value: Json) -> Field {
    match value {
        Json::Null => Field::null(),
        Json::Bool(b) => Field::boolean(b),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Field::long(v)
            } else if n.is_u64() {
                let digits = n.to_string();
                let precision = digits.len() as u32;
                Field::decimal(digits, precision, 0)
            } else {
                Field::double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Field::string(s),
        Json::Array(items) => Field::list(items.into_iter().map(json_to_field).collect()),
        Json::Object(entries) => {
            Field::map_from(entries.into_iter().map(|(k, v)| (k, json_to_field(v))))
        }
    }
}

pub struct JsonDecoder {
    content: JsonContent,
    max_object_length: Option<usize>,
    charset: Charset,
    text: String,
    base: u64,
    pos: usize,
    finished: bool,
}

impl JsonDecoder {
    pub fn new(config: &JsonConfig, charset: Charset) -> Self {
        Self {
            content: config.json_content,
            max_object_length: config.max_object_length,
            charset,
            text: String::new(),
            base: 0,
            pos: 0,
            finished: false,
        }
    }

    fn offset(&self, pos: usize) -> u64 {
        self.base + pos as u64
    }

    fn skip_whitespace(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    /// Parse one value at the current position.
    fn parse_value(&self) -> Result<(Json, usize), serde_json::Error> {
        let mut stream = serde_json::Deserializer::from_str(&self.text[self.pos..]).into_iter::<Json>();
        match stream.next() {
            Some(Ok(value)) => Ok((value, stream.byte_offset())),
            Some(Err(e)) => Err(e),
            None => Err(serde::de::Error::custom("unexpected end of input")),
        }
    }

    fn emit(&self, start: usize, value: Json, len: usize) -> Decoded {
        let (from, to) = (self.offset(start), self.offset(start + len));
        match self.max_object_length {
            Some(max) if len > max => Decoded::invalid(
                from,
                to,
                Field::string(&self.text[start..start + len]),
                format!("object length {len} exceeds max_object_length {max}"),
            ),
            _ => Decoded::record(from, to, json_to_field(value)),
        }
    }

    fn next_multiple(&mut self) -> Option<Decoded> {
        self.skip_whitespace();
        if self.pos >= self.text.len() {
            return None;
        }
        let start = self.pos;
        match self.parse_value() {
            Ok((value, len)) => {
                self.pos += len;
                Some(self.emit(start, value, len))
            }
            Err(e) => {
                // Resynchronise on the next line.
                let rest = &self.text[start..];
                let skip = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
                self.pos += skip;
                Some(Decoded::invalid(
                    self.offset(start),
                    self.offset(self.pos),
                    Field::string(rest[..skip].trim_end()),
                    e.to_string(),
                ))
            }
        }
    }

    fn next_array_element(&mut self) -> Result<Option<Decoded>, FormatError> {
        if self.finished {
            return Ok(None);
        }
        self.skip_whitespace();
        match self.peek() {
            Some(']') => {
                self.pos += 1;
                self.finished = true;
                return Ok(None);
            }
            Some(',') => {
                self.pos += 1;
                self.skip_whitespace();
            }
            None => {
                return Err(FormatError::malformed(
                    "JSON",
                    self.offset(self.pos),
                    "array is not terminated",
                ));
            }
            Some(_) => {}
        }

        let start = self.pos;
        let (value, len) = self
            .parse_value()
            .map_err(|e| FormatError::malformed("JSON", self.offset(start), e.to_string()))?;
        self.pos += len;
        Ok(Some(self.emit(start, value, len)))
    }
}

impl Decode for JsonDecoder {
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> Result<(), FormatError> {
        let (base, text) = input.read_document(self.charset)?;
        self.base = base;
        self.text = text;
        self.pos = 0;
        self.finished = false;

        if self.content == JsonContent::ArrayObjects {
            self.skip_whitespace();
            if self.peek() != Some('[') {
                return Err(FormatError::malformed(
                    "JSON",
                    self.offset(self.pos),
                    "expected a top-level array",
                ));
            }
            self.pos += 1;
        }

        if resume_at > self.offset(self.pos) {
            let target = (resume_at - self.base) as usize;
            if target > self.text.len() || !self.text.is_char_boundary(target) {
                return Err(FormatError::malformed("JSON", resume_at, "invalid resume offset"));
            }
            self.pos = target;
        }
        Ok(())
    }

    fn next(&mut self, _input: &mut ByteReader) -> Result<Option<Decoded>, FormatError> {
        match self.content {
            JsonContent::MultipleObjects => Ok(self.next_multiple()),
            JsonContent::ArrayObjects => self.next_array_element(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_all, DecodedItem};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn decoder(content: JsonContent) -> JsonDecoder {
        JsonDecoder::new(
            &JsonConfig {
                json_content: content,
                max_object_length: None,
            },
            Charset::utf8(),
        )
    }

    fn records(items: &[Decoded]) -> Vec<Json> {
        items
            .iter()
            .filter_map(|d| match &d.item {
                DecodedItem::Record { root, .. } => Some(root.to_json()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_json_to_field_numbers() {
        assert_eq!(json_to_field(json!(42)), Field::long(42));
        assert_eq!(json_to_field(json!(1.5)), Field::double(1.5));
        let big = json_to_field(json!(18446744073709551615u64));
        assert_eq!(big.attribute("scale"), Some("0"));
        assert_eq!(big.to_json(), json!("18446744073709551615"));
    }

    #[test]
    fn test_multiple_objects_with_offsets() {
        let data = b"{\"a\":1}\n{\"b\":[true,null]}\n";
        let items = decode_all(&mut decoder(JsonContent::MultipleObjects), data);
        assert_eq!(records(&items), vec![json!({"a": 1}), json!({"b": [true, null]})]);
        assert_eq!((items[0].start, items[0].end), (0, 7));
        assert_eq!((items[1].start, items[1].end), (8, 25));
    }

    #[test]
    fn test_multiple_objects_recovers_after_bad_line() {
        let data = b"{\"a\":1}\n{broken\n{\"c\":3}\n";
        let items = decode_all(&mut decoder(JsonContent::MultipleObjects), data);
        assert_eq!(records(&items), vec![json!({"a": 1}), json!({"c": 3})]);
        assert!(matches!(items[1].item, DecodedItem::Invalid { .. }));
    }

    #[test]
    fn test_array_objects() {
        let data = b"[ {\"a\":1},\n {\"a\":2} ]";
        let items = decode_all(&mut decoder(JsonContent::ArrayObjects), data);
        assert_eq!(records(&items), vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[test]
    fn test_array_resume() {
        let data = b"[{\"a\":1},{\"a\":2},{\"a\":3}]".to_vec();
        let mut d = decoder(JsonContent::ArrayObjects);
        let mut input = ByteReader::from_bytes(data);
        d.start(&mut input, 8).unwrap();
        let item = d.next(&mut input).unwrap().unwrap();
        assert_eq!(records(&[item]), vec![json!({"a": 2})]);
    }

    #[test]
    fn test_array_requires_bracket() {
        let mut d = decoder(JsonContent::ArrayObjects);
        let mut input = ByteReader::from_bytes(b"{\"a\":1}".to_vec());
        assert!(matches!(
            d.start(&mut input, 0),
            Err(FormatError::Malformed { .. })
        ));
    }

    #[test]
    fn test_max_object_length() {
        let mut d = JsonDecoder::new(
            &JsonConfig {
                json_content: JsonContent::MultipleObjects,
                max_object_length: Some(10),
            },
            Charset::utf8(),
        );
        let items = decode_all(&mut d, b"{\"a\":1}\n{\"long\":\"value\"}\n");
        assert_eq!(records(&items), vec![json!({"a": 1})]);
        assert!(matches!(items[1].item, DecodedItem::Invalid { .. }));
    }
}
