//! CPU inference core for Kyutai Pocket TTS.
//!
//! Runs the full pipeline from token ids to raw 24 kHz samples on plain
//! CPUs: a safetensors-backed weight store, a dense f32 tensor core with
//! AVX2/NEON inner loops, the FlowLM autoregressive transformer with its
//! flow-matching latent decoder, and the Mimi convolutional audio
//! decoder.
//!
//! ```no_run
//! use pocket_tts_core::{GenerateOptions, PocketTts};
//!
//! # fn main() -> pocket_tts_core::Result<()> {
//! let model = PocketTts::load("model.safetensors")?;
//! let samples = model.generate(&[10, 20, 30], &GenerateOptions::default())?;
//! # let _ = samples;
//! # Ok(())
//! # }
//! ```
//!
//! Tokenization, audio container writing and logging configuration are
//! the embedder's responsibility; the core returns in-memory tensors and
//! sample vectors only. Parallelism is controlled by two process-wide
//! worker knobs, [`set_tensor_workers`] and [`set_conv_workers`], both
//! defaulting to sequential execution.

pub mod error;
pub mod models;
pub mod modules;
pub mod parity;
pub mod runtime;
pub mod tensor;
pub mod weights;

#[cfg(test)]
mod test_checkpoint;

pub use error::{Error, Result};
pub use models::{FlowLm, FlowLmConfig, FlowLmState, GenerateOptions, Mimi, MimiConfig, PocketTts};
pub use runtime::{conv_workers, set_conv_workers, set_tensor_workers, tensor_workers};
pub use tensor::Tensor;
pub use weights::{VarBuilder, WeightStore};
