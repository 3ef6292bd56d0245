use serde::{Deserialize, Serialize};

use crate::error::{BlobError, Result};

/// Encoding used when text is written to or read from an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];

impl TextEncoding {
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            Self::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        BlobError::Encoding(format!("`{c}` cannot be represented in Latin-1"))
                    })
                })
                .collect(),
        }
    }

    /// Decodes `bytes`, dropping a leading byte-order mark.
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Self::Utf8 => {
                let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| BlobError::Encoding(format!("invalid UTF-8: {e}")))
            }
            Self::Utf16Le => {
                let bytes = bytes.strip_prefix(UTF16LE_BOM).unwrap_or(bytes);
                if bytes.len() % 2 != 0 {
                    return Err(BlobError::Encoding(
                        "odd number of bytes in UTF-16 text".into(),
                    ));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16(&units)
                    .map_err(|e| BlobError::Encoding(format!("invalid UTF-16: {e}")))
            }
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}
