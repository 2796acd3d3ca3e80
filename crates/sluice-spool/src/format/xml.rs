//! XML: one record per delimiter element, or the whole document.
//!
//! Element mapping:
//!
//! - an element without child elements becomes a string field holding its text;
//! - an element with children becomes a map keyed by child name, repeated
//!   names collapse into a list, and any text goes under `value`;
//! - XML attributes become field attributes.

use super::{ByteReader, Decode, Decoded, FormatError};
use crate::charset::Charset;
use crate::config::XmlConfig;
use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sluice_core::Field;
use std::collections::{BTreeMap, VecDeque};

struct Node {
    name: String,
    attributes: BTreeMap<String, String>,
    children: IndexMap<String, Vec<Field>>,
    text: String,
    start: u64,
}

impl Node {
    fn open(element: &BytesStart<'_>, start: u64) -> Result<Self, String> {
        let mut attributes = BTreeMap::new();
        for attr in element.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            attributes.insert(
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                value.into_owned(),
            );
        }
        Ok(Self {
            name: String::from_utf8_lossy(element.name().as_ref()).into_owned(),
            attributes,
            children: IndexMap::new(),
            text: String::new(),
            start,
        })
    }

    fn into_field(self) -> Field {
        let mut field = if self.children.is_empty() {
            Field::string(self.text)
        } else {
            let mut map: IndexMap<String, Field> = self
                .children
                .into_iter()
                .map(|(name, mut fields)| {
                    let value = if fields.len() == 1 {
                        fields.remove(0)
                    } else {
                        Field::list(fields)
                    };
                    (name, value)
                })
                .collect();
            if !self.text.is_empty() {
                map.insert("value".to_string(), Field::string(self.text));
            }
            Field::map(map)
        };
        field.attributes = self.attributes;
        field
    }
}

/// Walks a document and collects record elements.
struct DocumentParser<'a> {
    delimiter: Option<&'a str>,
    base: u64,
    resume_at: u64,
    stack: Vec<Node>,
    depth: usize,
    seen_root: bool,
    records: VecDeque<Decoded>,
}

impl<'a> DocumentParser<'a> {
    fn malformed(&self, offset: u64, message: impl Into<String>) -> FormatError {
        FormatError::malformed("XML", self.base + offset, message)
    }

    fn open(&mut self, element: &BytesStart<'_>, start: u64) -> Result<(), FormatError> {
        if self.depth == 0 {
            if self.seen_root {
                return Err(self.malformed(start, "more than one root element"));
            }
            self.seen_root = true;
        }
        self.depth += 1;

        let capture = !self.stack.is_empty()
            || match self.delimiter {
                None => true,
                Some(name) => element.name().as_ref() == name.as_bytes(),
            };
        if capture {
            let node = Node::open(element, start).map_err(|e| self.malformed(start, e))?;
            self.stack.push(node);
        }
        Ok(())
    }

    fn close(&mut self, end: u64) {
        self.depth = self.depth.saturating_sub(1);
        let Some(node) = self.stack.pop() else {
            return;
        };
        let start = node.start;
        let name = node.name.clone();
        let field = node.into_field();
        match self.stack.last_mut() {
            Some(parent) => parent.children.entry(name).or_default().push(field),
            None => {
                let (from, to) = (self.base + start, self.base + end);
                if to > self.resume_at {
                    self.records.push_back(Decoded::record(from, to, field));
                }
            }
        }
    }

    fn text(&mut self, text: &str, offset: u64) -> Result<(), FormatError> {
        match self.stack.last_mut() {
            Some(node) => node.text.push_str(text),
            None if self.depth == 0 && !text.trim().is_empty() => {
                return Err(self.malformed(offset, "text outside the root element"));
            }
            None => {}
        }
        Ok(())
    }

    fn run(mut self, text: &str) -> Result<VecDeque<Decoded>, FormatError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        loop {
            let before = reader.buffer_position() as u64;
            let event = reader
                .read_event()
                .map_err(|e| self.malformed(reader.buffer_position() as u64, e.to_string()))?;
            match event {
                Event::Start(element) => self.open(&element, before)?,
                Event::Empty(element) => {
                    self.open(&element, before)?;
                    self.close(reader.buffer_position() as u64);
                }
                Event::End(_) => self.close(reader.buffer_position() as u64),
                Event::Text(t) => {
                    let value = t.unescape().map_err(|e| self.malformed(before, e.to_string()))?;
                    self.text(&value, before)?;
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data).into_owned();
                    self.text(&value, before)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let end = text.len() as u64;
        if !self.seen_root {
            return Err(self.malformed(0, "document has no root element"));
        }
        if self.depth != 0 {
            return Err(self.malformed(end, "unexpected end of document"));
        }
        Ok(self.records)
    }
}

pub struct XmlDecoder {
    delimiter: Option<String>,
    charset: Charset,
    pending: VecDeque<Decoded>,
}

impl XmlDecoder {
    pub fn new(config: &XmlConfig, charset: Charset) -> Self {
        Self {
            delimiter: config.delimiter_element.clone().filter(|d| !d.is_empty()),
            charset,
            pending: VecDeque::new(),
        }
    }
}

impl Decode for XmlDecoder {
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> Result<(), FormatError> {
        let (base, text) = input.read_document(self.charset)?;
        let parser = DocumentParser {
            delimiter: self.delimiter.as_deref(),
            base,
            resume_at,
            stack: Vec::new(),
            depth: 0,
            seen_root: false,
            records: VecDeque::new(),
        };
        self.pending = parser.run(&text)?;
        Ok(())
    }

    fn next(&mut self, _input: &mut ByteReader) -> Result<Option<Decoded>, FormatError> {
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_all, DecodedItem};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const BOOKS: &[u8] = br#"<?xml version="1.0"?>
<library>
  <book id="1"><title>Hobbit</title><tag>a</tag><tag>b</tag></book>
  <book id="2"><title>Silmarillion</title></book>
</library>"#;

    fn decoder(delimiter: Option<&str>) -> XmlDecoder {
        XmlDecoder::new(
            &XmlConfig {
                delimiter_element: delimiter.map(str::to_string),
            },
            Charset::utf8(),
        )
    }

    fn roots(items: &[Decoded]) -> Vec<Field> {
        items
            .iter()
            .filter_map(|d| match &d.item {
                DecodedItem::Record { root, .. } => Some(root.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_delimiter_element_records() {
        let items = decode_all(&mut decoder(Some("book")), BOOKS);
        let roots = roots(&items);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].to_json(), json!({"title": "Hobbit", "tag": ["a", "b"]}));
        assert_eq!(roots[0].attribute("id"), Some("1"));
        assert_eq!(roots[1].to_json(), json!({"title": "Silmarillion"}));
        assert!(items[0].end <= items[1].start);
    }

    #[test]
    fn test_whole_document_record() {
        let items = decode_all(&mut decoder(None), BOOKS);
        let roots = roots(&items);
        assert_eq!(roots.len(), 1);
        let books = roots[0].get("/book").and_then(Field::as_list).unwrap();
        assert_eq!(books.len(), 2);
    }

    #[test]
    fn test_text_next_to_children_goes_under_value() {
        let items = decode_all(&mut decoder(None), b"<a>note<b>x</b></a>");
        assert_eq!(roots(&items)[0].to_json(), json!({"b": "x", "value": "note"}));
    }

    #[test]
    fn test_resume_skips_delivered_records() {
        let mut d = decoder(Some("book"));
        let first_end = decode_all(&mut decoder(Some("book")), BOOKS)[0].end;
        let mut input = ByteReader::from_bytes(BOOKS.to_vec());
        d.start(&mut input, first_end).unwrap();
        let item = d.next(&mut input).unwrap().unwrap();
        assert_eq!(roots(&[item])[0].attribute("id"), Some("2"));
        assert!(d.next(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_plain_text_is_malformed() {
        let mut d = decoder(None);
        let mut input = ByteReader::from_bytes(b"This is line 1\nThis is line 2\n".to_vec());
        assert!(matches!(
            d.start(&mut input, 0),
            Err(FormatError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unclosed_document_is_malformed() {
        let mut d = decoder(Some("book"));
        let mut input = ByteReader::from_bytes(b"<library><book>".to_vec());
        assert!(d.start(&mut input, 0).is_err());
    }
}
