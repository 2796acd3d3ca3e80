//! Character set handling
//!
//! Thin wrapper over [`encoding_rs`]. Decoding never fails: bytes that are
//! invalid in the configured encoding become replacement characters, so a
//! wrongly configured charset yields records whose text differs from the
//! source rather than errors.

use encoding_rs::{Encoding, UTF_8};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A resolved character encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    encoding: &'static Encoding,
}

impl Charset {
    /// Resolve a WHATWG label such as `UTF-8`, `Big5` or `US-ASCII`.
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(|encoding| Self { encoding })
    }

    pub fn utf8() -> Self {
        Self { encoding: UTF_8 }
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// True when ASCII bytes (in particular `\n`) keep their meaning.
    pub fn is_ascii_compatible(&self) -> bool {
        self.encoding.is_ascii_compatible()
    }

    /// Decode bytes without BOM sniffing.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, _had_errors) = self.encoding.decode_without_bom_handling(bytes);
        text.into_owned()
    }

    /// Encode text, used for configured delimiters.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.encoding.output_encoding().encode(text);
        bytes.into_owned()
    }

    /// Length of a byte order mark for this encoding at the start of `bytes`.
    pub fn bom_len(&self, bytes: &[u8]) -> usize {
        match Encoding::for_bom(bytes) {
            Some((encoding, len)) if encoding == self.encoding => len,
            _ if self.encoding == UTF_8 && bytes.starts_with(UTF8_BOM) => UTF8_BOM.len(),
            _ => 0,
        }
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::utf8()
    }
}
