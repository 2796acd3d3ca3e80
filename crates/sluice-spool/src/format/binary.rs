//! BINARY and WHOLE_FILE: one atomic record per file.

use super::{ByteReader, Decode, Decoded, FileContext, FormatError};
use crate::config::BinaryConfig;
use sluice_core::Field;

/// Whole file content as a single bytes field.
pub struct BinaryDecoder {
    max_data_size: u64,
    done: bool,
}

impl BinaryDecoder {
    pub fn new(config: &BinaryConfig) -> Self {
        Self {
            max_data_size: config.max_data_size,
            done: false,
        }
    }
}

impl Decode for BinaryDecoder {
    fn start(&mut self, _input: &mut ByteReader, resume_at: u64) -> Result<(), FormatError> {
        self.done = resume_at > 0;
        Ok(())
    }

    fn next(&mut self, input: &mut ByteReader) -> Result<Option<Decoded>, FormatError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut bytes = Vec::new();
        let n = input.read_limited(self.max_data_size + 1, &mut bytes)? as u64;
        if n > self.max_data_size {
            return Err(FormatError::TooLarge {
                size: n,
                limit: self.max_data_size,
            });
        }
        Ok(Some(Decoded::record(0, n, Field::bytes(bytes))))
    }
}

/// File reference plus metadata; content is never read.
pub struct WholeFileDecoder {
    file: FileContext,
    done: bool,
}

impl WholeFileDecoder {
    pub fn new(file: FileContext) -> Self {
        Self { file, done: false }
    }

    fn root(&self) -> Field {
        let path = self.file.path.to_string_lossy().into_owned();
        let filename = self
            .file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = self
            .file
            .path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let info = Field::map_from([
            ("file", Field::string(path.clone())),
            ("filename", Field::string(filename)),
            ("size", Field::long(self.file.size as i64)),
            (
                "lastModifiedTime",
                Field::long(self.file.modified.timestamp_millis()),
            ),
            ("parentDirectory", Field::string(parent)),
        ]);
        Field::map_from([("fileRef", Field::string(path)), ("fileInfo", info)])
    }
}

impl Decode for WholeFileDecoder {
    fn start(&mut self, _input: &mut ByteReader, _resume_at: u64) -> Result<(), FormatError> {
        self.done = false;
        Ok(())
    }

    fn next(&mut self, _input: &mut ByteReader) -> Result<Option<Decoded>, FormatError> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(Decoded::record(0, 0, self.root())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_all, DecodedItem};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    #[test]
    fn test_binary_single_record() {
        let mut d = BinaryDecoder::new(&BinaryConfig::default());
        let items = decode_all(&mut d, &[0, 1, 2, 255]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].end, 4);
        let DecodedItem::Record { root, .. } = &items[0].item else {
            panic!("expected record");
        };
        assert_eq!(root, &Field::bytes(vec![0u8, 1, 2, 255]));
    }

    #[test]
    fn test_binary_too_large() {
        let mut d = BinaryDecoder::new(&BinaryConfig { max_data_size: 3 });
        let mut input = ByteReader::from_bytes(vec![0u8; 4]);
        d.start(&mut input, 0).unwrap();
        assert!(matches!(
            d.next(&mut input),
            Err(FormatError::TooLarge { size: 4, limit: 3 })
        ));
    }

    #[test]
    fn test_binary_resume_is_complete() {
        let mut d = BinaryDecoder::new(&BinaryConfig::default());
        let mut input = ByteReader::from_bytes(vec![1u8, 2]);
        d.start(&mut input, 2).unwrap();
        assert!(d.next(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_whole_file_metadata() {
        let modified = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut d = WholeFileDecoder::new(FileContext {
            path: PathBuf::from("/data/in/report.pdf"),
            size: 1234,
            modified,
        });
        let items = decode_all(&mut d, b"");
        assert_eq!(items.len(), 1);
        let DecodedItem::Record { root, .. } = &items[0].item else {
            panic!("expected record");
        };
        assert_eq!(
            root.to_json(),
            serde_json::json!({
                "fileRef": "/data/in/report.pdf",
                "fileInfo": {
                    "file": "/data/in/report.pdf",
                    "filename": "report.pdf",
                    "size": 1234,
                    "lastModifiedTime": modified.timestamp_millis(),
                    "parentDirectory": "/data/in",
                }
            })
        );
    }
}
