use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::File,
    io::{Read, Seek},
    path::Path,
    rc::Rc,
};

use thiserror::Error;
use zip::ZipArchive;

use crate::DataType;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Pickle error: {0}")]
    Pickle(String),
    #[error("No data.pkl member found in archive")]
    MissingPickle,
    #[error("Unsupported checkpoint byteorder {0:?} (expected \"little\")")]
    UnsupportedByteOrder(String),
    #[error("Unsupported torch storage type: {0}")]
    UnsupportedStorageType(String),
    #[error("Tensor \"{name}\" has non-contiguous strides {stride:?} for shape {shape:?} (not supported)")]
    NonContiguousTensor {
        name: String,
        shape: Box<[usize]>,
        stride: Box<[usize]>,
    },
    #[error("Tensor \"{name}\" data out of bounds (storage bytes {storage_bytes}, need {need_bytes} at offset {offset_bytes})")]
    TensorOutOfBounds {
        name: String,
        storage_bytes: usize,
        need_bytes: usize,
        offset_bytes: usize,
    },
}

/// A tensor entry recovered from the pickle stream. Raw bytes stay in the
/// zip archive until [`TorchCheckpoint::load_tensor`] materializes them.
#[derive(Debug, Clone)]
pub struct TensorSpec {
    pub dtype: DataType,
    pub shape: Box<[usize]>,
    pub stride: Box<[usize]>,
    pub storage_key: String,
    pub storage_offset_elems: usize,
}

/// A materialized tensor: little-endian element bytes plus metadata.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub dtype: DataType,
    pub shape: Box<[usize]>,
    pub data: Vec<u8>,
}

/// A `torch.save` zip checkpoint opened for reading.
///
/// The state dict is parsed eagerly; tensor payloads are read from the
/// archive per entry. Keys iterate in sorted order.
pub struct TorchCheckpoint<R: Read + Seek> {
    archive: ZipArchive<R>,
    prefix: String,
    pub tensors: BTreeMap<String, TensorSpec>,
}

impl TorchCheckpoint<File> {
    pub fn open_from_path(path: &Path) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(file)?;
        Self::open_from_archive(archive)
    }
}

impl<R: Read + Seek> TorchCheckpoint<R> {
    pub fn open_from_archive(
        mut archive: ZipArchive<R>,
    ) -> Result<Self, CheckpointError> {
        // torch names the archive root after the saved file, so the prefix
        // has to be discovered from the data.pkl member.
        let pickle_name = archive
            .file_names()
            .find(|name| {
                *name == "data.pkl" || name.ends_with("/data.pkl")
            })
            .map(str::to_string)
            .ok_or(CheckpointError::MissingPickle)?;
        let prefix = pickle_name
            .strip_suffix("data.pkl")
            .unwrap_or("")
            .to_string();

        // Newer torch versions record the storage byteorder as a member.
        let byteorder_name = format!("{prefix}byteorder");
        if let Ok(mut f) = archive.by_name(&byteorder_name) {
            let mut s = String::new();
            f.read_to_string(&mut s)?;
            let s = s.trim();
            if s != "little" {
                return Err(CheckpointError::UnsupportedByteOrder(
                    s.to_string(),
                ));
            }
        }

        let mut pkl = Vec::new();
        archive.by_name(&pickle_name)?.read_to_end(&mut pkl)?;

        let tensors = PickleMachine::new(&pkl).parse_state_dict()?;

        Ok(Self {
            archive,
            prefix,
            tensors,
        })
    }

    pub fn load_tensor(
        &mut self,
        name: &str,
    ) -> Result<Tensor, CheckpointError> {
        let spec = self.tensors.get(name).cloned().ok_or_else(|| {
            CheckpointError::Pickle(format!("Missing tensor {name}"))
        })?;
        self.load_tensor_from_spec(name, &spec)
    }

    pub fn load_tensor_from_spec(
        &mut self,
        name: &str,
        spec: &TensorSpec,
    ) -> Result<Tensor, CheckpointError> {
        let path = format!("{}data/{}", self.prefix, spec.storage_key);
        let mut f = self.archive.by_name(&path)?;
        let mut storage = Vec::with_capacity(f.size() as usize);
        f.read_to_end(&mut storage)?;

        let elem_bytes = spec.dtype.size_in_bytes();
        let numel: usize = spec.shape.iter().product();
        let expected_stride = contiguous_stride(&spec.shape);
        if spec.stride.as_ref() != expected_stride.as_slice() {
            return Err(CheckpointError::NonContiguousTensor {
                name: name.to_string(),
                shape: spec.shape.clone(),
                stride: spec.stride.clone(),
            });
        }

        let begin = spec.storage_offset_elems * elem_bytes;
        let need = numel * elem_bytes;
        let end = begin + need;
        if end > storage.len() {
            return Err(CheckpointError::TensorOutOfBounds {
                name: name.to_string(),
                storage_bytes: storage.len(),
                need_bytes: need,
                offset_bytes: begin,
            });
        }

        Ok(Tensor {
            dtype: spec.dtype,
            shape: spec.shape.clone(),
            data: storage[begin..end].to_vec(),
        })
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

fn storage_data_type(
    module: &str,
    name: &str,
) -> Option<DataType> {
    match (module, name) {
        ("torch", "DoubleStorage") => Some(DataType::F64),
        ("torch", "FloatStorage") => Some(DataType::F32),
        ("torch", "HalfStorage") => Some(DataType::F16),
        ("torch", "BFloat16Storage") => Some(DataType::BF16),
        ("torch", "LongStorage") => Some(DataType::I64),
        ("torch", "IntStorage") => Some(DataType::I32),
        ("torch", "ShortStorage") => Some(DataType::I16),
        ("torch", "CharStorage") => Some(DataType::I8),
        ("torch", "ByteStorage") => Some(DataType::U8),
        ("torch", "BoolStorage") => Some(DataType::Bool),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct GlobalRef {
    module: String,
    name: String,
}

#[derive(Debug, Clone)]
struct StorageRef {
    dtype: DataType,
    key: String,
    _numel: usize,
}

#[derive(Clone)]
enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    String(String),
    Tuple(Vec<Value>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    Global(GlobalRef),
    Storage(StorageRef),
    Tensor(TensorSpec),
    RootDict,
}

/// Minimal pickle virtual machine for the opcode subset `torch.save`
/// emits for state dicts (protocol 2). The first `OrderedDict` (or the
/// topmost empty dict) becomes the root; tensor-valued entries of the root
/// go into the result, everything else is parsed and dropped.
struct PickleMachine<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: Vec<Option<Value>>,
    root_created: bool,
    root: BTreeMap<String, TensorSpec>,
}

impl<'a> PickleMachine<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: Vec::new(),
            root_created: false,
            root: BTreeMap::new(),
        }
    }

    fn parse_state_dict(
        mut self,
    ) -> Result<BTreeMap<String, TensorSpec>, CheckpointError> {
        while self.pos < self.bytes.len() {
            let op = self.read_u8()?;
            match op {
                0x80 => {
                    // PROTO
                    let _v = self.read_u8()?;
                },
                b'c' => {
                    // GLOBAL: module\nname\n
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global(GlobalRef {
                        module,
                        name,
                    }));
                },
                b'(' => {
                    // MARK
                    self.marks.push(self.stack.len());
                },
                b')' => {
                    // EMPTY_TUPLE
                    self.stack.push(Value::Tuple(Vec::new()));
                },
                b'}' => {
                    // EMPTY_DICT: a bare dict at the bottom of the stack is
                    // the state dict itself (torch.save of a plain dict).
                    if !self.root_created && self.stack.is_empty() {
                        self.root_created = true;
                        self.stack.push(Value::RootDict);
                    } else {
                        self.stack.push(Value::Dict(Rc::new(
                            RefCell::new(Vec::new()),
                        )));
                    }
                },
                b']' => {
                    // EMPTY_LIST
                    self.stack
                        .push(Value::List(Rc::new(RefCell::new(Vec::new()))));
                },
                b'N' => {
                    // NONE
                    self.stack.push(Value::None);
                },
                b'X' => {
                    // BINUNICODE (u32 len + bytes)
                    let len = self.read_u32_le()? as usize;
                    let s = self.read_utf8(len)?;
                    self.stack.push(Value::String(s));
                },
                b'K' => {
                    // BININT1
                    let v = self.read_u8()? as i64;
                    self.stack.push(Value::Int(v));
                },
                b'M' => {
                    // BININT2
                    let v = self.read_u16_le()? as i64;
                    self.stack.push(Value::Int(v));
                },
                b'J' => {
                    // BININT (i32)
                    let v = self.read_i32_le()? as i64;
                    self.stack.push(Value::Int(v));
                },
                0x8a => {
                    // LONG1: u8 length + little-endian two's complement
                    let len = self.read_u8()? as usize;
                    let v = self.read_long1(len)?;
                    self.stack.push(Value::Int(v));
                },
                b'G' => {
                    // BINFLOAT (big-endian f64)
                    let v = self.read_f64_be()?;
                    self.stack.push(Value::Float(v));
                },
                0x88 => {
                    // NEWTRUE
                    self.stack.push(Value::Bool(true));
                },
                0x89 => {
                    // NEWFALSE
                    self.stack.push(Value::Bool(false));
                },
                b't' => {
                    // TUPLE (MARK ... items)
                    let mark = self.marks.pop().ok_or_else(|| {
                        CheckpointError::Pickle("TUPLE without MARK".into())
                    })?;
                    let items = self.stack.split_off(mark);
                    self.stack.push(Value::Tuple(items));
                },
                0x85 => {
                    // TUPLE1
                    let v = self.pop()?;
                    self.stack.push(Value::Tuple(vec![v]));
                },
                0x86 => {
                    // TUPLE2
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                },
                0x87 => {
                    // TUPLE3
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                },
                b'q' => {
                    // BINPUT
                    let idx = self.read_u8()? as usize;
                    self.memo_set(idx)?;
                },
                b'r' => {
                    // LONG_BINPUT
                    let idx = self.read_u32_le()? as usize;
                    self.memo_set(idx)?;
                },
                b'h' => {
                    // BINGET
                    let idx = self.read_u8()? as usize;
                    let v = self.memo_get(idx)?;
                    self.stack.push(v);
                },
                b'j' => {
                    // LONG_BINGET
                    let idx = self.read_u32_le()? as usize;
                    let v = self.memo_get(idx)?;
                    self.stack.push(v);
                },
                b'Q' => {
                    // BINPERSID
                    let pid = self.pop()?;
                    let storage = self.persistent_load(pid)?;
                    self.stack.push(storage);
                },
                b'R' => {
                    // REDUCE
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let out = self.reduce(callable, args)?;
                    self.stack.push(out);
                },
                b's' => {
                    // SETITEM
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.dict_set_item(key, value)?;
                },
                b'u' => {
                    // SETITEMS
                    let mark = self.marks.pop().ok_or_else(|| {
                        CheckpointError::Pickle(
                            "SETITEMS without MARK".into(),
                        )
                    })?;
                    let items = self.stack.split_off(mark);
                    if items.len() % 2 != 0 {
                        return Err(CheckpointError::Pickle(
                            "SETITEMS expected even number of items".into(),
                        ));
                    }
                    for pair in items.chunks_exact(2) {
                        let key = pair[0].clone();
                        let value = pair[1].clone();
                        self.dict_set_item(key, value)?;
                    }
                },
                b'a' => {
                    // APPEND
                    let value = self.pop()?;
                    self.list_append(vec![value])?;
                },
                b'e' => {
                    // APPENDS
                    let mark = self.marks.pop().ok_or_else(|| {
                        CheckpointError::Pickle(
                            "APPENDS without MARK".into(),
                        )
                    })?;
                    let items = self.stack.split_off(mark);
                    self.list_append(items)?;
                },
                b'b' => {
                    // BUILD: ignore state and keep instance
                    let _state = self.pop()?;
                    let inst = self.pop()?;
                    self.stack.push(inst);
                },
                b'.' => {
                    // STOP
                    return Ok(self.root);
                },
                other => {
                    return Err(CheckpointError::Pickle(format!(
                        "Unsupported pickle opcode 0x{other:02x} at pos {}",
                        self.pos.saturating_sub(1)
                    )));
                },
            }
        }
        Err(CheckpointError::Pickle(
            "Unexpected end of pickle stream".into(),
        ))
    }

    fn dict_set_item(
        &mut self,
        key: Value,
        value: Value,
    ) -> Result<(), CheckpointError> {
        let dict = self.stack.last().ok_or_else(|| {
            CheckpointError::Pickle("SETITEM with empty stack".into())
        })?;
        match dict {
            Value::RootDict => {
                let Value::String(key) = key else {
                    return Ok(());
                };
                // Non-tensor entries (scalars, _metadata dicts) are legal in
                // a state dict and ignored here.
                let Value::Tensor(spec) = value else {
                    return Ok(());
                };
                self.root.insert(key, spec);
                Ok(())
            },
            Value::Dict(m) => {
                m.borrow_mut().push((key, value));
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn list_append(
        &mut self,
        values: Vec<Value>,
    ) -> Result<(), CheckpointError> {
        let list = self.stack.last().ok_or_else(|| {
            CheckpointError::Pickle("APPEND with empty stack".into())
        })?;
        if let Value::List(l) = list {
            l.borrow_mut().extend(values);
        }
        Ok(())
    }

    fn reduce(
        &mut self,
        callable: Value,
        args: Value,
    ) -> Result<Value, CheckpointError> {
        let Value::Global(global) = callable else {
            return Err(CheckpointError::Pickle(
                "REDUCE expected GLOBAL callable".into(),
            ));
        };
        let Value::Tuple(args) = args else {
            return Err(CheckpointError::Pickle(
                "REDUCE expected tuple args".into(),
            ));
        };

        match (global.module.as_str(), global.name.as_str()) {
            ("collections", "OrderedDict") => {
                if !self.root_created {
                    self.root_created = true;
                    Ok(Value::RootDict)
                } else {
                    Ok(Value::Dict(Rc::new(RefCell::new(Vec::new()))))
                }
            },
            ("torch._utils", "_rebuild_tensor_v2") => {
                // Args: (storage, storage_offset, size, stride,
                //        requires_grad, backward_hooks)
                if args.len() != 6 {
                    return Err(CheckpointError::Pickle(format!(
                        "_rebuild_tensor_v2 expected 6 args, got {}",
                        args.len()
                    )));
                }

                let Value::Storage(storage) = args[0].clone() else {
                    return Err(CheckpointError::Pickle(
                        "_rebuild_tensor_v2 arg0 must be Storage".into(),
                    ));
                };
                let storage_offset_elems = as_usize(&args[1])?;
                let shape = tuple_usizes(&args[2])?;
                let stride = tuple_usizes(&args[3])?;

                Ok(Value::Tensor(TensorSpec {
                    dtype: storage.dtype,
                    shape,
                    stride,
                    storage_key: storage.key,
                    storage_offset_elems,
                }))
            },
            _ => Err(CheckpointError::Pickle(format!(
                "Unsupported REDUCE callable {}.{}",
                global.module, global.name
            ))),
        }
    }

    fn persistent_load(
        &self,
        pid: Value,
    ) -> Result<Value, CheckpointError> {
        let Value::Tuple(items) = pid else {
            return Err(CheckpointError::Pickle(
                "BINPERSID expected tuple pid".into(),
            ));
        };
        if items.len() != 5 {
            return Err(CheckpointError::Pickle(format!(
                "Unsupported persistent id tuple length {}",
                items.len()
            )));
        }
        let Value::String(kind) = &items[0] else {
            return Err(CheckpointError::Pickle(
                "persistent id kind must be string".into(),
            ));
        };
        if kind != "storage" {
            return Err(CheckpointError::Pickle(format!(
                "Unsupported persistent id kind {kind:?}"
            )));
        }
        let Value::Global(storage_type) = &items[1] else {
            return Err(CheckpointError::Pickle(
                "persistent id storage type must be GLOBAL".into(),
            ));
        };
        let dtype = storage_data_type(
            &storage_type.module,
            &storage_type.name,
        )
        .ok_or_else(|| {
            CheckpointError::UnsupportedStorageType(format!(
                "{}.{}",
                storage_type.module, storage_type.name
            ))
        })?;
        let Value::String(key) = &items[2] else {
            return Err(CheckpointError::Pickle(
                "persistent id storage key must be string".into(),
            ));
        };
        let numel = as_usize(&items[4])?;
        Ok(Value::Storage(StorageRef {
            dtype,
            key: key.clone(),
            _numel: numel,
        }))
    }

    fn memo_set(
        &mut self,
        idx: usize,
    ) -> Result<(), CheckpointError> {
        let v = self.stack.last().cloned().ok_or_else(|| {
            CheckpointError::Pickle("BINPUT with empty stack".into())
        })?;
        if self.memo.len() <= idx {
            self.memo.resize_with(idx + 1, || None);
        }
        self.memo[idx] = Some(v);
        Ok(())
    }

    fn memo_get(
        &self,
        idx: usize,
    ) -> Result<Value, CheckpointError> {
        self.memo.get(idx).and_then(|v| v.clone()).ok_or_else(|| {
            CheckpointError::Pickle(format!("Missing memo index {idx}"))
        })
    }

    fn pop(&mut self) -> Result<Value, CheckpointError> {
        self.stack.pop().ok_or_else(|| {
            CheckpointError::Pickle("Unexpected empty stack".into())
        })
    }

    fn read_u8(&mut self) -> Result<u8, CheckpointError> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| {
            CheckpointError::Pickle("Unexpected EOF".into())
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16_le(&mut self) -> Result<u16, CheckpointError> {
        let b0 = self.read_u8()? as u16;
        let b1 = self.read_u8()? as u16;
        Ok(b0 | (b1 << 8))
    }

    fn read_u32_le(&mut self) -> Result<u32, CheckpointError> {
        let b0 = self.read_u8()? as u32;
        let b1 = self.read_u8()? as u32;
        let b2 = self.read_u8()? as u32;
        let b3 = self.read_u8()? as u32;
        Ok(b0 | (b1 << 8) | (b2 << 16) | (b3 << 24))
    }

    fn read_i32_le(&mut self) -> Result<i32, CheckpointError> {
        Ok(self.read_u32_le()? as i32)
    }

    fn read_long1(
        &mut self,
        len: usize,
    ) -> Result<i64, CheckpointError> {
        if len > 8 {
            return Err(CheckpointError::Pickle(format!(
                "LONG1 of {len} bytes does not fit an i64"
            )));
        }
        let mut buf = [0u8; 8];
        for slot in buf.iter_mut().take(len) {
            *slot = self.read_u8()?;
        }
        // Sign-extend from the most significant supplied byte.
        if len > 0 && buf[len - 1] & 0x80 != 0 {
            for slot in buf.iter_mut().skip(len) {
                *slot = 0xff;
            }
        }
        Ok(i64::from_le_bytes(buf))
    }

    fn read_f64_be(&mut self) -> Result<f64, CheckpointError> {
        let mut buf = [0u8; 8];
        for slot in buf.iter_mut() {
            *slot = self.read_u8()?;
        }
        Ok(f64::from_be_bytes(buf))
    }

    fn read_line(&mut self) -> Result<String, CheckpointError> {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
        if self.pos >= self.bytes.len() {
            return Err(CheckpointError::Pickle(
                "GLOBAL missing newline".into(),
            ));
        }
        let line = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|e| {
                CheckpointError::Pickle(format!("Invalid UTF-8: {e}"))
            })?;
        self.pos += 1; // consume newline
        Ok(line.to_string())
    }

    fn read_utf8(
        &mut self,
        len: usize,
    ) -> Result<String, CheckpointError> {
        let end = self.pos + len;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            CheckpointError::Pickle("BINUNICODE out of bounds".into())
        })?;
        self.pos = end;
        std::str::from_utf8(slice).map(|s| s.to_string()).map_err(|e| {
            CheckpointError::Pickle(format!("Invalid UTF-8: {e}"))
        })
    }
}

fn as_usize(v: &Value) -> Result<usize, CheckpointError> {
    match v {
        Value::Int(i) => (*i).try_into().map_err(|_| {
            CheckpointError::Pickle("negative int".into())
        }),
        _ => Err(CheckpointError::Pickle("Expected integer".into())),
    }
}

fn tuple_usizes(v: &Value) -> Result<Box<[usize]>, CheckpointError> {
    let Value::Tuple(items) = v else {
        return Err(CheckpointError::Pickle("Expected tuple".into()));
    };
    items
        .iter()
        .map(as_usize)
        .collect::<Result<Vec<_>, _>>()
        .map(Vec::into_boxed_slice)
}
