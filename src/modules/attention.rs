//! Scaled-dot-product attention: the fused causal-masked softmax, the
//! per-row fast path, the KV cache, and the fused-QKV self-attention
//! block the transformer stacks share.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::runtime::{self, SendPtr};
use crate::tensor::{pool, simd, Tensor};

use super::rotary::RotaryEmbedding;

/// Minimum FMA count before the fused attention path spreads its
/// per-(batch, head, query) jobs over the tensor-worker pool.
const ATTENTION_PAR_THRESHOLD: usize = 1 << 20;

/// Masks entries of `scores [..., Q, K]` where `ki > qi + offset` to
/// negative infinity.
pub fn apply_causal_mask(scores: &mut Tensor, offset: usize) -> Result<()> {
    if scores.rank() < 2 {
        return Err(Error::RankMismatch { op: "causal_mask", expected: 2, got: scores.rank() });
    }
    let kdim = scores.shape()[scores.rank() - 1];
    let qdim = scores.shape()[scores.rank() - 2];
    let data = scores.data_mut();
    for (flat, row) in data.chunks_mut(kdim).enumerate() {
        let qi = flat % qdim;
        let keep = (qi + offset + 1).min(kdim);
        for slot in &mut row[keep..] {
            *slot = f32::NEG_INFINITY;
        }
    }
    Ok(())
}

/// In-place `softmax(mask(scores * scale))` over the last dimension.
///
/// All-masked rows become all zeros; any other row with a zero or NaN
/// normalization sum is a fatal numerical error.
pub fn scale_mask_softmax(scores: &mut Tensor, scale: f32, causal: bool, offset: usize) -> Result<()> {
    if scores.rank() < 2 {
        return Err(Error::RankMismatch { op: "softmax", expected: 2, got: scores.rank() });
    }
    let kdim = scores.shape()[scores.rank() - 1];
    let qdim = scores.shape()[scores.rank() - 2];
    if kdim == 0 {
        return Err(Error::invalid("softmax", "non-positive dim"));
    }
    let data = scores.data_mut();
    for (flat, row) in data.chunks_mut(kdim).enumerate() {
        let qi = flat % qdim;
        let keep = if causal { (qi + offset + 1).min(kdim) } else { kdim };
        if keep == 0 {
            row.fill(0.0);
            continue;
        }
        let mut max = f32::NEG_INFINITY;
        for v in &mut row[..keep] {
            *v *= scale;
            max = max.max(*v);
        }
        let mut sum = 0.0f32;
        for v in &mut row[..keep] {
            *v = (*v - max).exp();
            sum += *v;
        }
        if sum == 0.0 || sum.is_nan() {
            return Err(Error::SoftmaxNormalization);
        }
        let inv = 1.0 / sum;
        for v in &mut row[..keep] {
            *v *= inv;
        }
        row[keep..].fill(0.0);
    }
    Ok(())
}

/// `softmax(mask(q k^T / sqrt(d))) v`.
///
/// Rank-4 inputs take a fused path that never materializes the score
/// matrix: one job per `(batch, head, query)` computes scaled dots
/// against the keys, normalizes in a scratch row, and folds value rows
/// into the output with `axpy`. Other ranks fall back to the matmul
/// chain.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
    offset: usize,
) -> Result<Tensor> {
    if q.rank() == 4 && k.rank() == 4 && v.rank() == 4 {
        return fused_attention(q, k, v, causal, offset);
    }
    let d = q.shape()[q.rank() - 1];
    let scale = 1.0 / (d as f32).sqrt();
    let kt = k.transpose(-2, -1)?;
    let mut scores = q.matmul(&kt)?;
    scale_mask_softmax(&mut scores, scale, causal, offset)?;
    scores.matmul(v)
}

fn fused_attention(q: &Tensor, k: &Tensor, v: &Tensor, causal: bool, offset: usize) -> Result<Tensor> {
    let (b, h, tq, d) = (q.shape()[0], q.shape()[1], q.shape()[2], q.shape()[3]);
    let (tk, dv) = (k.shape()[2], v.shape()[3]);
    if k.shape()[0] != b || k.shape()[1] != h || v.shape()[0] != b || v.shape()[1] != h {
        return Err(Error::ShapeMismatch {
            op: "attention",
            expected: q.shape().to_vec(),
            got: k.shape().to_vec(),
        });
    }
    if k.shape()[3] != d || v.shape()[2] != tk {
        return Err(Error::ShapeMismatch {
            op: "attention",
            expected: k.shape().to_vec(),
            got: v.shape().to_vec(),
        });
    }
    let scale = 1.0 / (d as f32).sqrt();
    let mut out = vec![0.0f32; b * h * tq * dv];

    let jobs = b * h * tq;
    let work = jobs * tk * (d + dv);
    let workers = runtime::tensor_workers();
    let parallel = workers > 1 && jobs > 1 && work >= ATTENTION_PAR_THRESHOLD;

    let qd = q.data();
    let kd = k.data();
    let vd = v.data();
    let ptr = SendPtr(out.as_mut_ptr());
    let failed = AtomicBool::new(false);

    runtime::run_jobs(if parallel { workers } else { 1 }, jobs, |job| {
        let qi = job % tq;
        let bh = job / tq;
        let q_row = &qd[(bh * tq + qi) * d..(bh * tq + qi + 1) * d];
        let k_base = bh * tk * d;
        let v_base = bh * tk * dv;
        let keep = if causal { (qi + offset + 1).min(tk) } else { tk };
        let dst = unsafe { ptr.slice_mut((bh * tq + qi) * dv, dv) };
        if keep == 0 {
            return;
        }
        let mut weights = pool::get_scratch(keep);
        let mut max = f32::NEG_INFINITY;
        for ki in 0..keep {
            let s = simd::dot(q_row, &kd[k_base + ki * d..k_base + (ki + 1) * d]) * scale;
            weights[ki] = s;
            max = max.max(s);
        }
        let mut sum = 0.0f32;
        for w in weights.iter_mut() {
            *w = (*w - max).exp();
            sum += *w;
        }
        if sum == 0.0 || sum.is_nan() {
            failed.store(true, Ordering::Relaxed);
            return;
        }
        let inv = 1.0 / sum;
        for (ki, w) in weights.iter().enumerate() {
            let w = w * inv;
            if w != 0.0 {
                simd::axpy(dst, w, &vd[v_base + ki * dv..v_base + (ki + 1) * dv]);
            }
        }
    });

    if failed.load(Ordering::Relaxed) {
        return Err(Error::SoftmaxNormalization);
    }
    Tensor::new(out, &[b, h, tq, dv])
}

/// Per-layer key/value cache. Grows by appending along the sequence
/// axis; `seq_len` always equals the cached length. Not thread-safe: a
/// cache belongs to exactly one generation request.
#[derive(Debug, Default, Clone)]
pub struct KvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
    seq_len: usize,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Appends `k, v [B, H, T, D]` and returns the full cached pair.
    pub fn append(&mut self, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        let added = k.dim(2)?;
        let (k_all, v_all) = match (&self.k, &self.v) {
            (Some(pk), Some(pv)) => (Tensor::concat(&[pk, &k], 2)?, Tensor::concat(&[pv, &v], 2)?),
            _ => (k, v),
        };
        self.seq_len += added;
        self.k = Some(k_all.clone());
        self.v = Some(v_all.clone());
        Ok((k_all, v_all))
    }

    pub fn clear(&mut self) {
        self.k = None;
        self.v = None;
        self.seq_len = 0;
    }
}

/// Fused-QKV multi-head self-attention: one `in_proj` producing Q, K and
/// V stacked along the last dim, RoPE on queries and keys, then the
/// fused SDPA. Shared by the FlowLM and Mimi transformer stacks.
#[derive(Debug)]
pub struct SelfAttention {
    in_proj: Tensor,
    out_proj: Tensor,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn new(in_proj: Tensor, out_proj: Tensor, num_heads: usize) -> Result<Self> {
        let dim = out_proj.dim(0)?;
        if dim % num_heads != 0 {
            return Err(Error::invalid(
                "attention",
                format!("model dim {dim} not divisible by {num_heads} heads"),
            ));
        }
        if in_proj.dim(0)? != dim * 3 || in_proj.dim(1)? != dim {
            return Err(Error::ShapeMismatch {
                op: "attention",
                expected: vec![dim * 3, dim],
                got: in_proj.shape().to_vec(),
            });
        }
        Ok(Self { in_proj, out_proj, num_heads, head_dim: dim / num_heads })
    }

    /// `x [B, T, C]`; `pos` is the cache length before this call. With
    /// `causal` the new block is masked at `offset = pos`; a single-step
    /// call attends to the whole cache with `causal = false` because the
    /// cache length itself bounds what the query can see.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: Option<&RotaryEmbedding>,
        cache: Option<&mut KvCache>,
        pos: usize,
        causal: bool,
    ) -> Result<Tensor> {
        let (b, t, c) = (x.dim(0)?, x.dim(1)?, x.dim(2)?);
        let qkv = x.linear(&self.in_proj, None)?;
        let q = qkv.narrow(2, 0, c)?;
        let k = qkv.narrow(2, c, c)?;
        let v = qkv.narrow(2, 2 * c, c)?;

        let split = |t4: &Tensor| -> Result<Tensor> {
            t4.reshape(&[b, t, self.num_heads, self.head_dim])?.transpose(1, 2)
        };
        let mut q = split(&q)?;
        let mut k = split(&k)?;
        let v = split(&v)?;

        if let Some(rope) = rope {
            rope.apply(&mut q, pos)?;
            rope.apply(&mut k, pos)?;
        }

        let (k, v) = match cache {
            Some(cache) => cache.append(k, v)?,
            None => (k, v),
        };

        let ctx = scaled_dot_product_attention(&q, &k, &v, causal, pos)?;
        let ctx = ctx.transpose(1, 2)?.reshape(&[b, t, c])?;
        ctx.linear(&self.out_proj, None)
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }
}
