mod safetensors_metadata;
mod safetensors_writer;

pub use safetensors_metadata::{
    Dtype, HashMetadata, HeaderError, TensorInfo,
    read_metadata as read_safetensors_metadata,
};
pub use safetensors_writer::{SafetensorView, WriteError, write_safetensors};
