#![allow(dead_code)]

use std::{fs::File, io::Write, path::Path};

use half::{bf16, f16};
use tensorcast::DataType;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub struct FixtureTensor {
    pub name: &'static str,
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

pub fn f32_payload(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn f64_payload(values: &[f64]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn f16_payload(values: &[f32]) -> Vec<u8> {
    let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
    bytemuck::cast_slice(&halves).to_vec()
}

pub fn bf16_payload(values: &[f32]) -> Vec<u8> {
    let halves: Vec<bf16> =
        values.iter().map(|&v| bf16::from_f32(v)).collect();
    bytemuck::cast_slice(&halves).to_vec()
}

pub fn i64_payload(values: &[i64]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn i32_payload(values: &[i32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

/// Writes a torch-format zip checkpoint with the default `archive/` root,
/// matching what `torch.save` produces for a state dict.
pub fn write_torch_checkpoint(
    path: &Path,
    tensors: &[FixtureTensor],
) {
    write_torch_checkpoint_with_prefix(path, "archive", tensors);
}

pub fn write_torch_checkpoint_with_prefix(
    path: &Path,
    prefix: &str,
    tensors: &[FixtureTensor],
) {
    let pickle = state_dict_pickle(tensors);
    write_archive(path, prefix, b"little", &pickle, tensors);
}

pub fn write_archive(
    path: &Path,
    prefix: &str,
    byteorder: &[u8],
    pickle: &[u8],
    tensors: &[FixtureTensor],
) {
    let file = File::create(path).expect("create checkpoint file");
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored);

    zip.start_file(format!("{prefix}/byteorder"), options)
        .expect("start byteorder");
    zip.write_all(byteorder).expect("write byteorder");

    zip.start_file(format!("{prefix}/data.pkl"), options)
        .expect("start data.pkl");
    zip.write_all(pickle).expect("write data.pkl");

    for (index, tensor) in tensors.iter().enumerate() {
        zip.start_file(format!("{prefix}/data/{index}"), options)
            .expect("start storage member");
        zip.write_all(&tensor.data).expect("write storage member");
    }

    zip.finish().expect("finish zip");
}

/// Emits the protocol-2 pickle stream `torch.save` writes for a state dict:
/// an `OrderedDict` root populated via SETITEMS, one `_rebuild_tensor_v2`
/// REDUCE per tensor, storages referenced through persistent ids.
pub fn state_dict_pickle(tensors: &[FixtureTensor]) -> Vec<u8> {
    let mut pkl = vec![0x80, 0x02];
    let mut memo = MemoCounter::default();

    emit_global(&mut pkl, "collections", "OrderedDict");
    pkl.push(b')'); // EMPTY_TUPLE
    pkl.push(b'R'); // REDUCE -> root dict
    memo.put(&mut pkl);

    pkl.push(b'('); // MARK for SETITEMS
    for (index, tensor) in tensors.iter().enumerate() {
        emit_unicode(&mut pkl, tensor.name);
        memo.put(&mut pkl);
        emit_tensor_value(
            &mut pkl,
            &mut memo,
            storage_class(tensor.dtype),
            &index.to_string(),
            &tensor.shape,
            tensor.data.len() / tensor.dtype.size_in_bytes(),
        );
    }
    pkl.push(b'u'); // SETITEMS
    pkl.push(b'.'); // STOP
    pkl
}

/// Emits one tensor value: persistent-id storage tuple, then the
/// `_rebuild_tensor_v2` REDUCE with contiguous strides and zero offset.
pub fn emit_tensor_value(
    pkl: &mut Vec<u8>,
    memo: &mut MemoCounter,
    storage_class: &str,
    storage_key: &str,
    shape: &[usize],
    numel: usize,
) {
    emit_global(pkl, "torch._utils", "_rebuild_tensor_v2");
    memo.put(pkl);

    pkl.push(b'('); // MARK: args tuple

    pkl.push(b'('); // MARK: persistent id tuple
    emit_unicode(pkl, "storage");
    emit_global(pkl, "torch", storage_class);
    memo.put(pkl);
    emit_unicode(pkl, storage_key);
    emit_unicode(pkl, "cpu");
    emit_int(pkl, numel);
    pkl.push(b't'); // TUPLE
    pkl.push(b'Q'); // BINPERSID

    emit_int(pkl, 0); // storage offset

    pkl.push(b'('); // size
    for &dim in shape {
        emit_int(pkl, dim);
    }
    pkl.push(b't');
    memo.put(pkl);

    pkl.push(b'('); // stride (row-major contiguous)
    for &s in &contiguous_stride(shape) {
        emit_int(pkl, s);
    }
    pkl.push(b't');
    memo.put(pkl);

    pkl.push(0x89); // NEWFALSE: requires_grad

    // backward_hooks: an empty (non-root) OrderedDict
    emit_global(pkl, "collections", "OrderedDict");
    pkl.push(b')');
    pkl.push(b'R');
    memo.put(pkl);

    pkl.push(b't'); // args 6-tuple
    pkl.push(b'R'); // REDUCE -> tensor
    memo.put(pkl);
}

pub fn emit_global(
    pkl: &mut Vec<u8>,
    module: &str,
    name: &str,
) {
    pkl.push(b'c');
    pkl.extend_from_slice(module.as_bytes());
    pkl.push(b'\n');
    pkl.extend_from_slice(name.as_bytes());
    pkl.push(b'\n');
}

pub fn emit_unicode(
    pkl: &mut Vec<u8>,
    s: &str,
) {
    pkl.push(b'X');
    pkl.extend_from_slice(&(s.len() as u32).to_le_bytes());
    pkl.extend_from_slice(s.as_bytes());
}

pub fn emit_int(
    pkl: &mut Vec<u8>,
    v: usize,
) {
    if v < 256 {
        pkl.push(b'K');
        pkl.push(v as u8);
    } else if v < 65536 {
        pkl.push(b'M');
        pkl.extend_from_slice(&(v as u16).to_le_bytes());
    } else {
        pkl.push(b'J');
        pkl.extend_from_slice(&(v as i32).to_le_bytes());
    }
}

#[derive(Default)]
pub struct MemoCounter(u32);

impl MemoCounter {
    pub fn put(
        &mut self,
        pkl: &mut Vec<u8>,
    ) {
        if self.0 < 256 {
            pkl.push(b'q');
            pkl.push(self.0 as u8);
        } else {
            pkl.push(b'r');
            pkl.extend_from_slice(&self.0.to_le_bytes());
        }
        self.0 += 1;
    }
}

fn storage_class(dtype: DataType) -> &'static str {
    match dtype {
        DataType::F64 => "DoubleStorage",
        DataType::F32 => "FloatStorage",
        DataType::F16 => "HalfStorage",
        DataType::BF16 => "BFloat16Storage",
        DataType::I64 => "LongStorage",
        DataType::I32 => "IntStorage",
        DataType::I16 => "ShortStorage",
        DataType::I8 => "CharStorage",
        DataType::U8 => "ByteStorage",
        DataType::Bool => "BoolStorage",
    }
}

fn contiguous_stride(shape: &[usize]) -> Vec<usize> {
    let mut stride = vec![0usize; shape.len()];
    let mut s = 1usize;
    for (i, &dim) in shape.iter().enumerate().rev() {
        stride[i] = s;
        s = s.saturating_mul(dim.max(1));
    }
    stride
}
