//! Signature bundle parsing
//!
//! The bundle is produced by the signing tool as JSON:
//!
//! ```json
//! { "index": 3, "sj": "0x1f..", "cj": "a0..", "eMj": "9c.." }
//! ```
//!
//! The fields are forwarded to the device untouched, nothing here checks the
//! signature itself.

use std::path::Path;

use data_encoding::HEXLOWER_PERMISSIVE;

use crate::error::UploadError;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("index {0:?} is not an integer in 0..=255")]
    InvalidIndex(String),
    #[error("{field} has an odd number of hex digits ({digits})")]
    OddLength { field: &'static str, digits: usize },
    #[error("{field} has a non-hex character at position {position}")]
    InvalidHex { field: &'static str, position: usize },
}

/// `index` is written as a number by some signing tools and as a string by others
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum IndexField {
    Number(i64),
    Text(String),
}

/// External representation of a signature bundle, as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignatureRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sj: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cj: Option<String>,
    #[serde(rename = "eMj", skip_serializing_if = "Option::is_none")]
    pub emj: Option<String>,
}

/// Decoded signature bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBundle {
    pub index: u8,
    pub sj: Vec<u8>,
    pub cj: Vec<u8>,
    /// Sent after INIT as CHUNK frames, its length goes into INIT
    pub emj: Vec<u8>,
}

impl SignatureBundle {
    pub fn from_record(record: SignatureRecord) -> Result<Self, SignatureError> {
        let index = record.index.ok_or(SignatureError::MissingField("index"))?;
        let sj = record.sj.ok_or(SignatureError::MissingField("sj"))?;
        let cj = record.cj.ok_or(SignatureError::MissingField("cj"))?;
        let emj = record.emj.ok_or(SignatureError::MissingField("eMj"))?;

        Ok(Self {
            index: parse_index(&index)?,
            sj: decode_hex("sj", strip_hex_prefix(&sj))?,
            cj: decode_hex("cj", &cj)?,
            emj: decode_hex("eMj", &emj)?,
        })
    }

    pub fn from_json(data: &str) -> Result<Self, SignatureError> {
        let record: SignatureRecord = serde_json::from_str(data)?;
        Self::from_record(record)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| UploadError::MissingSignatureFile {
            path: path.to_path_buf(),
            source,
        })?;
        let record: SignatureRecord = serde_json::from_slice(&data).map_err(SignatureError::from)?;
        Ok(Self::from_record(record)?)
    }

    /// External representation: lowercase hex, `sj` with a `0x` prefix
    pub fn to_record(&self) -> SignatureRecord {
        SignatureRecord {
            index: Some(IndexField::Number(self.index.into())),
            sj: Some(format!("0x{}", data_encoding::HEXLOWER.encode(&self.sj))),
            cj: Some(data_encoding::HEXLOWER.encode(&self.cj)),
            emj: Some(data_encoding::HEXLOWER.encode(&self.emj)),
        }
    }
}

fn parse_index(index: &IndexField) -> Result<u8, SignatureError> {
    match index {
        IndexField::Number(n) => u8::try_from(*n).map_err(|_| SignatureError::InvalidIndex(n.to_string())),
        IndexField::Text(s) => s
            .trim()
            .parse::<u8>()
            .map_err(|_| SignatureError::InvalidIndex(s.clone())),
    }
}

/// Only `sj` is written with a `0x` prefix, one is removed
fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

fn decode_hex(field: &'static str, digits: &str) -> Result<Vec<u8>, SignatureError> {
    if digits.len() % 2 != 0 {
        return Err(SignatureError::OddLength { field, digits: digits.len() });
    }

    HEXLOWER_PERMISSIVE
        .decode(digits.as_bytes())
        .map_err(|e| SignatureError::InvalidHex { field, position: e.position })
}
