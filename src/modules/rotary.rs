//! Interleaved-pair rotary position embeddings with precomputed tables.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Positions are precomputed up to this length at model load.
pub const MAX_SEQ_LEN: usize = 8192;

#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// `[max_seq, dim / 2]`, row-major.
    cos: Vec<f32>,
    sin: Vec<f32>,
    dim: usize,
    max_seq: usize,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, max_seq: usize, max_period: f32) -> Result<Self> {
        if dim == 0 || dim % 2 != 0 {
            return Err(Error::invalid("rope", format!("head dim {dim} must be even and non-zero")));
        }
        let half = dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / max_period.powf(i as f32 / half as f32))
            .collect();
        let mut cos = vec![0.0; max_seq * half];
        let mut sin = vec![0.0; max_seq * half];
        for t in 0..max_seq {
            for (j, &f) in inv_freq.iter().enumerate() {
                let angle = t as f32 * f;
                cos[t * half + j] = angle.cos();
                sin[t * half + j] = angle.sin();
            }
        }
        Ok(Self { cos, sin, dim, max_seq })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rotates `x [..., seq, dim]` in place, reading table rows
    /// `pos .. pos + seq`. Each interleaved pair `(a, b)` becomes
    /// `(a*c - b*s, a*s + b*c)`.
    pub fn apply(&self, x: &mut Tensor, pos: usize) -> Result<()> {
        if x.rank() < 2 {
            return Err(Error::RankMismatch { op: "rope", expected: 2, got: x.rank() });
        }
        let dim = x.shape()[x.rank() - 1];
        let seq = x.shape()[x.rank() - 2];
        if dim != self.dim {
            return Err(Error::ShapeMismatch {
                op: "rope",
                expected: vec![self.dim],
                got: vec![dim],
            });
        }
        if pos + seq > self.max_seq {
            return Err(Error::RopeCapacity { needed: pos + seq, capacity: self.max_seq });
        }
        let half = dim / 2;
        let rows = x.elem_count() / (seq * dim);
        let data = x.data_mut();
        for r in 0..rows {
            for t in 0..seq {
                let base = (r * seq + t) * dim;
                let table = (pos + t) * half;
                for j in 0..half {
                    let c = self.cos[table + j];
                    let s = self.sin[table + j];
                    let a = data[base + 2 * j];
                    let b = data[base + 2 * j + 1];
                    data[base + 2 * j] = a * c - b * s;
                    data[base + 2 * j + 1] = a * s + b * c;
                }
            }
        }
        Ok(())
    }
}
