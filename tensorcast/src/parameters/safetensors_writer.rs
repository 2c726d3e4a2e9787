use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use thiserror::Error;

use super::safetensors_metadata::{Dtype, HashMetadata, TensorInfo};
use crate::DataType;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid tensor data for \"{name}\": expected {expected} bytes, got {actual} bytes")]
    InvalidTensorData {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Failed to serialize safetensors header: {0}")]
    HeaderJson(#[from] serde_json::Error),
}

/// One tensor to be written: borrowed name, shape and raw little-endian
/// element bytes. Payloads land in the file in slice order.
#[derive(Debug, Clone, Copy)]
pub struct SafetensorView<'a> {
    pub name: &'a str,
    pub dtype: DataType,
    pub shape: &'a [usize],
    pub data: &'a [u8],
}

/// Writes a safetensors file: little-endian u64 header length, JSON header
/// padded with spaces to an 8-byte boundary, then the raw payloads back to
/// back.
pub fn write_safetensors(
    path: &Path,
    tensors: &[SafetensorView<'_>],
    metadata: Option<HashMap<String, String>>,
) -> Result<(), WriteError> {
    let header = build_header(tensors, metadata)?;

    let mut header_bytes = serde_json::to_vec(&header)?;
    let padded_len = header_bytes.len().next_multiple_of(8);
    header_bytes.resize(padded_len, b' ');

    let header_len: u64 = header_bytes
        .len()
        .try_into()
        .expect("header too large for u64");

    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(&header_len.to_le_bytes())?;
    w.write_all(&header_bytes)?;
    for t in tensors {
        w.write_all(t.data)?;
    }
    w.flush()?;
    Ok(())
}

fn build_header(
    tensors: &[SafetensorView<'_>],
    metadata: Option<HashMap<String, String>>,
) -> Result<HashMetadata, WriteError> {
    let mut header = HashMetadata {
        metadata,
        tensors: HashMap::new(),
    };

    let mut offset: usize = 0;
    for t in tensors {
        let elem_bytes = t.dtype.size_in_bytes();
        let numel: usize = t.shape.iter().product();
        let expected_bytes = numel.saturating_mul(elem_bytes);
        if expected_bytes != t.data.len() {
            return Err(WriteError::InvalidTensorData {
                name: t.name.to_string(),
                expected: expected_bytes,
                actual: t.data.len(),
            });
        }

        let begin = offset;
        let end = offset + t.data.len();
        offset = end;

        header.tensors.insert(
            t.name.to_string(),
            TensorInfo {
                dtype: Dtype::from(t.dtype),
                shape: t.shape.to_vec(),
                data_offsets: (begin, end),
            },
        );
    }

    Ok(header)
}
