//! Checkpoint access: the safetensors-backed weight store and the
//! path-prefixed `VarBuilder` the model loaders navigate it with.

pub mod store;
pub mod var_builder;

pub use store::{TensorInfo, WeightStore};
pub use var_builder::VarBuilder;
