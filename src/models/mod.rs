//! Model stacks: the FlowLM latent language model, the Mimi audio
//! decoder, and the facade that composes them.

pub mod flowlm;
pub mod mimi;
pub mod pocket_tts;

pub use flowlm::{make_gaussian_noise, FlowLm, FlowLmConfig, FlowLmState};
pub use mimi::{Mimi, MimiConfig};
pub use pocket_tts::{GenerateOptions, PocketTts};
