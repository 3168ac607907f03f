//! Text encoding policy
//!
//! Lua strings are byte strings. Host text crossing into the VM is encoded
//! with the runtime's configured [`Encoding`]; bytes coming back are only
//! decoded on request (or with `autodecode`).

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Supported text encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// UTF-8
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per code point up to U+00FF
    Latin1,
    /// 7-bit ASCII
    Ascii,
}

impl Encoding {
    /// Canonical encoding name
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Latin1 => "latin-1",
            Encoding::Ascii => "ascii",
        }
    }

    /// Encode host text to bytes
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| self.unencodable(c)))
                .collect(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { Ok(c as u8) } else { Err(self.unencodable(c)) })
                .collect(),
        }
    }

    /// Decode bytes to host text
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| {
                Error::Encoding(format!(
                    "'utf-8' codec can't decode byte at position {}",
                    e.utf8_error().valid_up_to()
                ))
            }),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(Error::Encoding(format!(
                    "'ascii' codec can't decode byte 0x{:02x} at position {}",
                    bytes[pos], pos
                ))),
                None => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            },
        }
    }

    fn unencodable(self, c: char) -> Error {
        Error::Encoding(format!("'{}' codec can't encode character {:?}", self.name(), c))
    }
}

/// Encode with an optional encoding, failing when none is configured
pub(crate) fn encode_with(encoding: Option<Encoding>, text: &str) -> Result<Vec<u8>> {
    match encoding {
        Some(encoding) => encoding.encode(text),
        None => Err(Error::Encoding(
            "encoding not specified, cannot convert text to a Lua string".to_string(),
        )),
    }
}

/// Decode with an optional encoding, failing when none is configured
pub(crate) fn decode_with(encoding: Option<Encoding>, bytes: &[u8]) -> Result<String> {
    match encoding {
        Some(encoding) => encoding.decode(bytes),
        None => Err(Error::Encoding(
            "encoding not specified, cannot decode a Lua string".to_string(),
        )),
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            other => Err(Error::Encoding(format!("unknown encoding: {}", other))),
        }
    }
}
