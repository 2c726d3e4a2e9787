mod torch_checkpoint;

pub use torch_checkpoint::{
    CheckpointError, Tensor, TensorSpec, TorchCheckpoint,
};
