use std::path::Path;

use half::{bf16, f16};
use thiserror::Error;

use crate::{
    DataType,
    checkpoint::{CheckpointError, TensorSpec, TorchCheckpoint},
    parameters::{SafetensorView, WriteError, write_safetensors},
};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Failed to load checkpoint: {0}")]
    Load(#[from] CheckpointError),
    #[error("Failed to save safetensors: {0}")]
    Save(#[from] WriteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSummary {
    pub tensors: usize,
    pub bytes_written: usize,
}

/// Converts a torch checkpoint into a float32 safetensors file.
///
/// Tensors are processed in sorted-name order. `on_tensor` is invoked once
/// per tensor with its name, shape and source dtype before the payload is
/// converted, so callers can report progress ahead of the final write.
/// Already-f32 tensors take the same copy path as everything else.
pub fn convert_to_f32_safetensors<F>(
    input: &Path,
    output: &Path,
    mut on_tensor: F,
) -> Result<ConvertSummary, ConvertError>
where
    F: FnMut(&str, &[usize], DataType),
{
    let mut checkpoint = TorchCheckpoint::open_from_path(input)?;

    // Clone the specs so tensors can be mutably read from the zip archive.
    let specs: Vec<(String, TensorSpec)> = checkpoint
        .tensors
        .iter()
        .map(|(name, spec)| (name.clone(), spec.clone()))
        .collect();

    let mut converted: Vec<(String, Box<[usize]>, Vec<u8>)> =
        Vec::with_capacity(specs.len());
    for (name, spec) in &specs {
        on_tensor(name, &spec.shape, spec.dtype);
        let tensor = checkpoint.load_tensor_from_spec(name, spec)?;
        let values = payload_to_f32(tensor.dtype, &tensor.data);
        let data = bytemuck::cast_slice::<f32, u8>(&values).to_vec();
        converted.push((name.clone(), tensor.shape, data));
    }

    let views: Vec<SafetensorView<'_>> = converted
        .iter()
        .map(|(name, shape, data)| SafetensorView {
            name,
            dtype: DataType::F32,
            shape,
            data,
        })
        .collect();
    write_safetensors(output, &views, None)?;

    Ok(ConvertSummary {
        tensors: converted.len(),
        bytes_written: converted.iter().map(|(_, _, data)| data.len()).sum(),
    })
}

/// Elementwise cast of a raw little-endian payload to f32. Integer and f64
/// sources follow `as f32` semantics, half types use their exact widening
/// conversion, bool maps to 0.0 / 1.0.
fn payload_to_f32(
    dtype: DataType,
    data: &[u8],
) -> Vec<f32> {
    match dtype {
        DataType::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(data),
        DataType::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(data)
            .iter()
            .map(|x| x.to_f32())
            .collect(),
        DataType::BF16 => bytemuck::pod_collect_to_vec::<u8, bf16>(data)
            .iter()
            .map(|x| x.to_f32())
            .collect(),
        DataType::F64 => bytemuck::pod_collect_to_vec::<u8, f64>(data)
            .iter()
            .map(|&x| x as f32)
            .collect(),
        DataType::I8 => bytemuck::pod_collect_to_vec::<u8, i8>(data)
            .iter()
            .map(|&x| x as f32)
            .collect(),
        DataType::U8 => data.iter().map(|&x| x as f32).collect(),
        DataType::I16 => bytemuck::pod_collect_to_vec::<u8, i16>(data)
            .iter()
            .map(|&x| x as f32)
            .collect(),
        DataType::I32 => bytemuck::pod_collect_to_vec::<u8, i32>(data)
            .iter()
            .map(|&x| x as f32)
            .collect(),
        DataType::I64 => bytemuck::pod_collect_to_vec::<u8, i64>(data)
            .iter()
            .map(|&x| x as f32)
            .collect(),
        DataType::Bool => data
            .iter()
            .map(|&x| if x != 0 { 1.0 } else { 0.0 })
            .collect(),
    }
}
