//! TEXT: one record per line (or per custom delimiter).

use super::{trim_line_ending, truncate_chars, ByteReader, Decode, Decoded, DecodedItem, FormatError};
use crate::charset::Charset;
use crate::config::TextConfig;
use sluice_core::Field;

pub struct TextDecoder {
    charset: Charset,
    max_line_length: usize,
    delimiter: Option<Vec<u8>>,
    include_delimiter: bool,
    buf: Vec<u8>,
}

impl TextDecoder {
    pub fn new(config: &TextConfig, charset: Charset) -> Self {
        let delimiter = config
            .use_custom_delimiter
            .then(|| charset.encode(&config.resolved_custom_delimiter()));
        Self {
            charset,
            max_line_length: config.max_line_length,
            delimiter,
            include_delimiter: config.include_custom_delimiter,
            buf: Vec::new(),
        }
    }
}

impl Decode for TextDecoder {
    fn start(&mut self, input: &mut ByteReader, resume_at: u64) -> Result<(), FormatError> {
        if resume_at == 0 {
            input.skip_bom(self.charset)?;
        } else {
            input.seek_to(resume_at)?;
        }
        Ok(())
    }

    fn next(&mut self, input: &mut ByteReader) -> Result<Option<Decoded>, FormatError> {
        let start = input.position();
        let n = match &self.delimiter {
            None => input.read_line(&mut self.buf)?,
            Some(delimiter) => input.read_record(delimiter, &mut self.buf)?,
        };
        if n == 0 {
            return Ok(None);
        }

        let content = match &self.delimiter {
            None => trim_line_ending(&self.buf),
            Some(_) if self.include_delimiter => &self.buf[..],
            Some(delimiter) => self.buf.strip_suffix(&delimiter[..]).unwrap_or(&self.buf),
        };
        let mut text = self.charset.decode(content);
        let truncated = truncate_chars(&mut text, self.max_line_length);

        Ok(Some(Decoded {
            start,
            end: input.position(),
            item: DecodedItem::Record {
                root: Field::map_from([("text", Field::string(text))]),
                truncated,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::decode_all;
    use pretty_assertions::assert_eq;

    fn texts(items: &[Decoded]) -> Vec<String> {
        items
            .iter()
            .filter_map(|d| match &d.item {
                DecodedItem::Record { root, .. } => {
                    root.get("/text").and_then(Field::as_str).map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_lines_and_offsets() {
        let mut decoder = TextDecoder::new(&TextConfig::default(), Charset::utf8());
        let items = decode_all(&mut decoder, b"This is line 1\r\nThis is line 2\nlast");
        assert_eq!(texts(&items), vec!["This is line 1", "This is line 2", "last"]);
        assert_eq!(items[0].end, 16);
        assert_eq!(items[1].start, 16);
        assert_eq!(items[2].end, 35);
    }

    #[test]
    fn test_resume_from_offset() {
        let bytes = b"one\ntwo\nthree\n";
        let mut decoder = TextDecoder::new(&TextConfig::default(), Charset::utf8());
        let mut input = ByteReader::from_bytes(bytes.to_vec());
        decoder.start(&mut input, 4).unwrap();
        let first = decoder.next(&mut input).unwrap().unwrap();
        assert_eq!(texts(&[first]), vec!["two"]);
    }

    #[test]
    fn test_truncation_flagged() {
        let config = TextConfig {
            max_line_length: 4,
            ..Default::default()
        };
        let mut decoder = TextDecoder::new(&config, Charset::utf8());
        let items = decode_all(&mut decoder, b"abcdefgh\nabc\n");
        assert_eq!(texts(&items), vec!["abcd", "abc"]);
        assert!(matches!(
            items[0].item,
            DecodedItem::Record { truncated: true, .. }
        ));
        assert!(matches!(
            items[1].item,
            DecodedItem::Record { truncated: false, .. }
        ));
    }

    #[test]
    fn test_custom_delimiter() {
        let config = TextConfig {
            use_custom_delimiter: true,
            custom_delimiter: "^".into(),
            ..Default::default()
        };
        let mut decoder = TextDecoder::new(&config, Charset::utf8());
        let items = decode_all(&mut decoder, b"a^b\nc^d");
        assert_eq!(texts(&items), vec!["a", "b\nc", "d"]);

        let keep = TextConfig {
            include_custom_delimiter: true,
            ..config
        };
        let mut decoder = TextDecoder::new(&keep, Charset::utf8());
        let items = decode_all(&mut decoder, b"a^b");
        assert_eq!(texts(&items), vec!["a^", "b"]);
    }

    #[test]
    fn test_big5_charset() {
        let big5 = Charset::for_label("Big5").unwrap();
        let mut decoder = TextDecoder::new(&TextConfig::default(), big5);
        let items = decode_all(&mut decoder, &[0xA4, 0xA4, 0xA4, 0xE5, b'\n']);
        assert_eq!(texts(&items), vec!["中文"]);
    }

    #[test]
    fn test_empty_input() {
        let mut decoder = TextDecoder::new(&TextConfig::default(), Charset::utf8());
        assert!(decode_all(&mut decoder, b"").is_empty());
    }
}
