pub mod checkpoint;
pub mod convert;
mod data_type;
pub mod parameters;

pub use convert::{ConvertError, ConvertSummary, convert_to_f32_safetensors};
pub use data_type::DataType;
