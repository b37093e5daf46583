//! Neural operator blocks shared by the FlowLM and Mimi stacks.

pub mod activations;
pub mod attention;
pub mod conv;
pub mod flownet;
pub mod rotary;

pub use attention::{KvCache, SelfAttention};
pub use rotary::RotaryEmbedding;
