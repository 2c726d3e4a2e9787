// Header model follows the safetensors format specification:
// https://github.com/huggingface/safetensors

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DataType;

// Upstream readers cap the header at 100MB; larger is considered corrupt.
const MAX_HEADER_SIZE: usize = 100_000_000;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("The file is smaller than the 8-byte header length prefix.")]
    HeaderTooSmall,
    #[error("The header length is invalid.")]
    InvalidHeaderLength,
    #[error("The header is not valid UTF-8.")]
    InvalidHeader,
    #[error("The header is valid UTF-8 but not the expected JSON: {0}")]
    InvalidHeaderDeserialization(#[from] serde_json::Error),
}

/// The JSON header of a safetensors file: optional `__metadata__` plus one
/// entry per tensor.
#[derive(Debug, Serialize, Deserialize)]
pub struct HashMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "__metadata__")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(flatten)]
    pub tensors: HashMap<String, TensorInfo>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TensorInfo {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data_offsets: (usize, usize),
}

/// Element types the safetensors format defines. The converter only ever
/// writes `F32`; the rest exist so headers produced by other tools still
/// parse.
#[derive(
    Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Ord, PartialOrd,
)]
#[non_exhaustive]
pub enum Dtype {
    BOOL,
    U8,
    I8,
    #[allow(non_camel_case_types)]
    F8_E5M2,
    #[allow(non_camel_case_types)]
    F8_E4M3,
    I16,
    U16,
    F16,
    BF16,
    I32,
    U32,
    F32,
    F64,
    I64,
    U64,
}

impl From<DataType> for Dtype {
    fn from(data_type: DataType) -> Self {
        match data_type {
            DataType::BF16 => Dtype::BF16,
            DataType::F16 => Dtype::F16,
            DataType::F32 => Dtype::F32,
            DataType::F64 => Dtype::F64,
            DataType::I8 => Dtype::I8,
            DataType::U8 => Dtype::U8,
            DataType::I16 => Dtype::I16,
            DataType::I32 => Dtype::I32,
            DataType::I64 => Dtype::I64,
            DataType::Bool => Dtype::BOOL,
        }
    }
}

/// Parses the header of a safetensors buffer. Returns the offset where
/// tensor data begins and the parsed header.
pub fn read_metadata(
    buffer: &[u8]
) -> Result<(usize, HashMetadata), HeaderError> {
    let prefix: [u8; 8] = buffer
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(HeaderError::HeaderTooSmall)?;
    let header_len: usize = u64::from_le_bytes(prefix)
        .try_into()
        .map_err(|_| HeaderError::InvalidHeaderLength)?;
    if header_len > MAX_HEADER_SIZE {
        return Err(HeaderError::InvalidHeaderLength);
    }
    let stop = header_len
        .checked_add(8)
        .ok_or(HeaderError::InvalidHeaderLength)?;
    let header_bytes = buffer
        .get(8..stop)
        .ok_or(HeaderError::InvalidHeaderLength)?;
    let string = core::str::from_utf8(header_bytes)
        .map_err(|_| HeaderError::InvalidHeader)?;
    // Trailing padding after the JSON object is space-filled by writers.
    let metadata: HashMetadata = serde_json::from_str(string.trim_end())?;
    Ok((stop, metadata))
}
