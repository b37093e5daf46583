//! Error type shared by the whole inference core.
//!
//! Kernels surface errors to their immediate caller; composition layers
//! wrap them with a short `"<component>: <op>"` context. Nothing is
//! retried inside the core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op}: shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{op}: rank mismatch: expected {expected}, got {got}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{op}: dimension {dim} out of range for rank {rank}")]
    DimOutOfRange {
        op: &'static str,
        dim: isize,
        rank: usize,
    },

    #[error("{op}: shapes {lhs:?} and {rhs:?} are not broadcast-compatible")]
    BroadcastIncompatible {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("{op}: {msg}")]
    InvalidArgument { op: &'static str, msg: String },

    /// The only numerical failure an operator can raise; callers treat it
    /// as a sign of corrupted weights or input.
    #[error("softmax: normalization sum is zero or NaN")]
    SoftmaxNormalization,

    #[error("tensor {0:?} not found in checkpoint")]
    TensorNotFound(String),

    #[error("tensor {name:?}: unsupported dtype {dtype:?} (only F32 is supported)")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("safetensors header: {0}")]
    HeaderParse(String),

    #[error("tensor {name:?}: data offsets [{start}, {end}) out of bounds for {len}-byte data segment")]
    InvalidOffsets {
        name: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("rope: position {needed} exceeds table capacity {capacity}")]
    RopeCapacity { needed: usize, capacity: usize },

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{ctx}: {source}")]
    Context {
        ctx: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Sentinel check exported at the API boundary: callers must be able
    /// to tell "not implemented" apart from real faults.
    pub fn is_not_implemented(&self) -> bool {
        match self {
            Error::NotImplemented(_) => true,
            Error::Context { source, .. } => source.is_not_implemented(),
            _ => false,
        }
    }

    pub(crate) fn invalid(op: &'static str, msg: impl Into<String>) -> Self {
        Error::InvalidArgument { op, msg: msg.into() }
    }
}

/// `"<component>: <op>: <cause>"` wrapping for composition layers.
pub(crate) trait Context<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    fn with_context(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T> Context<T> for Result<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context { ctx: ctx.into(), source: Box::new(e) })
    }

    fn with_context(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::Context { ctx: f(), source: Box::new(e) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_implemented_survives_context_wrapping() {
        let e: Result<()> = Err(Error::NotImplemented("voice encoder"));
        let e = e.context("model: encode_voice").unwrap_err();
        assert!(e.is_not_implemented());
        assert!(e.to_string().contains("voice encoder"));
    }

    #[test]
    fn plain_errors_are_not_the_sentinel() {
        let e = Error::TensorNotFound("flow_lm.bos_emb".into());
        assert!(!e.is_not_implemented());
    }
}
