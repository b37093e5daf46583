//! Dense row-major f32 tensors and the algebra the model layers build on.
//!
//! Every operation returns a freshly allocated tensor except `reshape`,
//! which only rewires shape metadata and shares the backing buffer.
//! In-place helpers copy-on-write when the buffer is shared, so a
//! reshaped view can never observe writes through its sibling.

pub mod pool;
pub mod simd;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::{self, SendPtr};

/// Minimum fused-multiply-add count before matmul spreads row jobs over
/// the tensor-worker pool. Must not be zero (unbounded spawning).
const MATMUL_PAR_THRESHOLD: usize = 1 << 19;
/// Same, for linear.
const LINEAR_PAR_THRESHOLD: usize = 1 << 18;

#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Arc<Vec<f32>>,
}

pub(crate) fn elem_count_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

pub(crate) fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// NumPy-style broadcast of two shapes, right-aligned.
pub(crate) fn broadcast_shapes(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let a = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let b = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        out[i] = if a == b || b == 1 {
            a
        } else if a == 1 {
            b
        } else {
            return Err(Error::BroadcastIncompatible {
                op,
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        };
    }
    Ok(out)
}

impl Tensor {
    /// Builds a tensor from a flat row-major buffer.
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let count = elem_count_of(shape);
        if data.len() != count {
            return Err(Error::invalid(
                "new",
                format!("inconsistent element count: {} values for shape {:?}", data.len(), shape),
            ));
        }
        Ok(Self { shape: shape.to_vec(), data: Arc::new(data) })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec(), data: Arc::new(vec![0.0; elem_count_of(shape)]) }
    }

    pub fn full(value: f32, shape: &[usize]) -> Self {
        Self { shape: shape.to_vec(), data: Arc::new(vec![value; elem_count_of(shape)]) }
    }

    pub fn scalar(value: f32) -> Self {
        Self { shape: Vec::new(), data: Arc::new(vec![value]) }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_count(&self) -> usize {
        elem_count_of(&self.shape)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the buffer; copies first if a reshape shares it.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.as_ref().clone()
    }

    /// Normalizes a possibly-negative dimension index.
    pub fn normalize_dim(&self, op: &'static str, dim: isize) -> Result<usize> {
        let rank = self.rank() as isize;
        let d = if dim < 0 { dim + rank } else { dim };
        if d < 0 || d >= rank {
            return Err(Error::DimOutOfRange { op, dim, rank: self.rank() });
        }
        Ok(d as usize)
    }

    pub fn dim(&self, dim: isize) -> Result<usize> {
        let d = self.normalize_dim("dim", dim)?;
        Ok(self.shape[d])
    }

    /// Metadata-only reshape; the returned tensor shares this buffer.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        if elem_count_of(shape) != self.elem_count() {
            return Err(Error::invalid(
                "reshape",
                format!("cannot reshape {:?} ({} elems) to {:?}", self.shape, self.elem_count(), shape),
            ));
        }
        Ok(Tensor { shape: shape.to_vec(), data: Arc::clone(&self.data) })
    }

    /// Copies `len` slices starting at `start` along `dim`.
    pub fn narrow(&self, dim: isize, start: usize, len: usize) -> Result<Tensor> {
        let d = self.normalize_dim("narrow", dim)?;
        if start + len > self.shape[d] {
            return Err(Error::invalid(
                "narrow",
                format!("range {}..{} out of bounds for dim of size {}", start, start + len, self.shape[d]),
            ));
        }
        let outer = elem_count_of(&self.shape[..d]);
        let inner = elem_count_of(&self.shape[d + 1..]);
        let src_stride = self.shape[d] * inner;
        let dst_stride = len * inner;
        let mut out = vec![0.0; outer * dst_stride];
        for o in 0..outer {
            let src = &self.data[o * src_stride + start * inner..o * src_stride + (start + len) * inner];
            out[o * dst_stride..(o + 1) * dst_stride].copy_from_slice(src);
        }
        let mut shape = self.shape.clone();
        shape[d] = len;
        Tensor::new(out, &shape)
    }

    /// Index-select along `dim`; every index is bounds-checked.
    pub fn gather(&self, dim: isize, indices: &[usize]) -> Result<Tensor> {
        let d = self.normalize_dim("gather", dim)?;
        let size = self.shape[d];
        for &i in indices {
            if i >= size {
                return Err(Error::invalid(
                    "gather",
                    format!("index {} out of bounds for dim of size {}", i, size),
                ));
            }
        }
        let outer = elem_count_of(&self.shape[..d]);
        let inner = elem_count_of(&self.shape[d + 1..]);
        let src_stride = size * inner;
        let dst_stride = indices.len() * inner;
        let mut out = vec![0.0; outer * dst_stride];
        for o in 0..outer {
            for (j, &i) in indices.iter().enumerate() {
                let src = &self.data[o * src_stride + i * inner..o * src_stride + (i + 1) * inner];
                out[o * dst_stride + j * inner..o * dst_stride + (j + 1) * inner].copy_from_slice(src);
            }
        }
        let mut shape = self.shape.clone();
        shape[d] = indices.len();
        Tensor::new(out, &shape)
    }

    /// Swaps two dimensions, materializing the permuted layout.
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Result<Tensor> {
        let mut d1 = self.normalize_dim("transpose", dim1)?;
        let mut d2 = self.normalize_dim("transpose", dim2)?;
        if d1 == d2 {
            return Ok(self.clone());
        }
        if d1 > d2 {
            std::mem::swap(&mut d1, &mut d2);
        }
        let a = elem_count_of(&self.shape[..d1]);
        let b = self.shape[d1];
        let c = elem_count_of(&self.shape[d1 + 1..d2]);
        let d = self.shape[d2];
        let e = elem_count_of(&self.shape[d2 + 1..]);

        let mut out = vec![0.0; self.elem_count()];
        let src = &self.data[..];
        // src layout: [a, b, c, d, e] -> dst layout: [a, d, c, b, e]
        for ia in 0..a {
            for ib in 0..b {
                for ic in 0..c {
                    for id in 0..d {
                        let s = (((ia * b + ib) * c + ic) * d + id) * e;
                        let t = (((ia * d + id) * c + ic) * b + ib) * e;
                        out[t..t + e].copy_from_slice(&src[s..s + e]);
                    }
                }
            }
        }
        let mut shape = self.shape.clone();
        shape.swap(d1, d2);
        Tensor::new(out, &shape)
    }

    /// Concatenates tensors along `dim`; all other dims must match.
    pub fn concat(tensors: &[&Tensor], dim: isize) -> Result<Tensor> {
        let first = *tensors.first().ok_or_else(|| Error::invalid("concat", "empty input"))?;
        let d = first.normalize_dim("concat", dim)?;
        let mut cat_size = 0;
        for t in tensors {
            if t.rank() != first.rank() {
                return Err(Error::RankMismatch { op: "concat", expected: first.rank(), got: t.rank() });
            }
            for (i, (&a, &b)) in first.shape.iter().zip(t.shape.iter()).enumerate() {
                if i != d && a != b {
                    return Err(Error::ShapeMismatch {
                        op: "concat",
                        expected: first.shape.clone(),
                        got: t.shape.clone(),
                    });
                }
            }
            cat_size += t.shape[d];
        }
        let outer = elem_count_of(&first.shape[..d]);
        let inner = elem_count_of(&first.shape[d + 1..]);
        let dst_stride = cat_size * inner;
        let mut out = vec![0.0; outer * dst_stride];
        for o in 0..outer {
            let mut at = 0;
            for t in tensors {
                let block = t.shape[d] * inner;
                let src = &t.data[o * block..(o + 1) * block];
                out[o * dst_stride + at..o * dst_stride + at + block].copy_from_slice(src);
                at += block;
            }
        }
        let mut shape = first.shape.clone();
        shape[d] = cat_size;
        Tensor::new(out, &shape)
    }

    fn binary_broadcast(
        &self,
        rhs: &Tensor,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor> {
        let out_shape = broadcast_shapes(op, &self.shape, &rhs.shape)?;
        let rank = out_shape.len();
        let count = elem_count_of(&out_shape);

        // Right-aligned strides, zeroed where a side broadcasts.
        let pad = |shape: &[usize]| -> Vec<usize> {
            let mut padded = vec![1; rank - shape.len()];
            padded.extend_from_slice(shape);
            padded
        };
        let ls = pad(&self.shape);
        let rs = pad(&rhs.shape);
        let mut lstride = strides_of(&ls);
        let mut rstride = strides_of(&rs);
        for i in 0..rank {
            if ls[i] == 1 && out_shape[i] != 1 {
                lstride[i] = 0;
            }
            if rs[i] == 1 && out_shape[i] != 1 {
                rstride[i] = 0;
            }
        }

        let mut out = vec![0.0; count];
        let mut idx = vec![0usize; rank];
        let mut loff = 0usize;
        let mut roff = 0usize;
        for slot in out.iter_mut() {
            *slot = f(self.data[loff], rhs.data[roff]);
            // Odometer increment from the innermost dim.
            for i in (0..rank).rev() {
                idx[i] += 1;
                loff += lstride[i];
                roff += rstride[i];
                if idx[i] < out_shape[i] {
                    break;
                }
                idx[i] = 0;
                loff -= lstride[i] * out_shape[i];
                roff -= rstride[i] * out_shape[i];
            }
        }
        Tensor::new(out, &out_shape)
    }

    pub fn broadcast_add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_broadcast(rhs, "broadcast_add", |a, b| a + b)
    }

    pub fn broadcast_mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_broadcast(rhs, "broadcast_mul", |a, b| a * b)
    }

    /// Numerically stable softmax along `dim`.
    pub fn softmax(&self, dim: isize) -> Result<Tensor> {
        let d = self.normalize_dim("softmax", dim)?;
        let n = self.shape[d];
        if n == 0 {
            return Err(Error::invalid("softmax", "non-positive dim"));
        }
        let outer = elem_count_of(&self.shape[..d]);
        let inner = elem_count_of(&self.shape[d + 1..]);
        let mut out = self.to_vec();
        for o in 0..outer {
            for i in 0..inner {
                let base = o * n * inner + i;
                let mut max = f32::NEG_INFINITY;
                for k in 0..n {
                    max = max.max(out[base + k * inner]);
                }
                let mut sum = 0.0f32;
                for k in 0..n {
                    let e = (out[base + k * inner] - max).exp();
                    out[base + k * inner] = e;
                    sum += e;
                }
                if sum == 0.0 || sum.is_nan() {
                    return Err(Error::SoftmaxNormalization);
                }
                let inv = 1.0 / sum;
                for k in 0..n {
                    out[base + k * inner] *= inv;
                }
            }
        }
        Tensor::new(out, &self.shape)
    }

    /// Layer normalization over the last dimension with population
    /// variance (divide by N).
    pub fn layer_norm(&self, weight: Option<&Tensor>, bias: Option<&Tensor>, eps: f32) -> Result<Tensor> {
        let n = *self
            .shape
            .last()
            .ok_or_else(|| Error::invalid("layer_norm", "scalar input"))?;
        if n == 0 {
            return Err(Error::invalid("layer_norm", "non-positive dim"));
        }
        for p in [weight, bias].into_iter().flatten() {
            if p.elem_count() != n {
                return Err(Error::ShapeMismatch {
                    op: "layer_norm",
                    expected: vec![n],
                    got: p.shape.to_vec(),
                });
            }
        }
        let rows = self.elem_count() / n;
        let mut out = vec![0.0; self.elem_count()];
        for r in 0..rows {
            let x = &self.data[r * n..(r + 1) * n];
            let y = &mut out[r * n..(r + 1) * n];
            let mean = x.iter().sum::<f32>() / n as f32;
            let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
            let inv = 1.0 / (var + eps).sqrt();
            for (i, (yv, xv)) in y.iter_mut().zip(x.iter()).enumerate() {
                let mut v = (xv - mean) * inv;
                if let Some(w) = weight {
                    v *= w.data[i];
                }
                if let Some(b) = bias {
                    v += b.data[i];
                }
                *yv = v;
            }
        }
        Tensor::new(out, &self.shape)
    }

    /// Batched matrix multiply; the last two dims form matrices and the
    /// leading dims broadcast NumPy-style.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                op: "matmul",
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let (m, k) = (self.shape[self.rank() - 2], self.shape[self.rank() - 1]);
        let (k2, n) = (rhs.shape[rhs.rank() - 2], rhs.shape[rhs.rank() - 1]);
        if k != k2 {
            return Err(Error::ShapeMismatch {
                op: "matmul",
                expected: self.shape.clone(),
                got: rhs.shape.clone(),
            });
        }
        let lbatch = &self.shape[..self.rank() - 2];
        let rbatch = &rhs.shape[..rhs.rank() - 2];
        let batch_shape = broadcast_shapes("matmul", lbatch, rbatch)?;
        let batches = elem_count_of(&batch_shape);

        // Per-batch base offsets, with zero stride where a side broadcasts.
        let base_offsets = |shape: &[usize], mat: usize| -> Vec<usize> {
            let rank = batch_shape.len();
            let mut padded = vec![1; rank - shape.len()];
            padded.extend_from_slice(shape);
            let mut strides = strides_of(&padded);
            for s in strides.iter_mut() {
                *s *= mat;
            }
            for i in 0..rank {
                if padded[i] == 1 && batch_shape[i] != 1 {
                    strides[i] = 0;
                }
            }
            let mut offsets = Vec::with_capacity(batches);
            let mut idx = vec![0usize; rank];
            let mut off = 0usize;
            for _ in 0..batches {
                offsets.push(off);
                for i in (0..rank).rev() {
                    idx[i] += 1;
                    off += strides[i];
                    if idx[i] < batch_shape[i] {
                        break;
                    }
                    idx[i] = 0;
                    off -= strides[i] * batch_shape[i];
                }
            }
            offsets
        };
        let loff = base_offsets(lbatch, m * k);
        let roff = base_offsets(rbatch, k * n);

        let mut out_shape = batch_shape;
        out_shape.push(m);
        out_shape.push(n);
        let mut out = vec![0.0; elem_count_of(&out_shape)];

        let total_fmas = batches * m * n * k;
        let workers = runtime::tensor_workers();
        let parallel = workers > 1 && m > 1 && total_fmas >= MATMUL_PAR_THRESHOLD;

        for b in 0..batches {
            let a = &self.data[loff[b]..loff[b] + m * k];
            let bm = &rhs.data[roff[b]..roff[b] + k * n];
            // Repack rhs column-major so each output element is one dot.
            let mut bt = pool::get_scratch(n * k);
            for kk in 0..k {
                for nn in 0..n {
                    bt[nn * k + kk] = bm[kk * n + nn];
                }
            }
            let out_base = b * m * n;
            let ptr = SendPtr(out.as_mut_ptr());
            let bt_ref: &[f32] = &bt;
            let row_job = |row: usize| {
                let dst = unsafe { ptr.slice_mut(out_base + row * n, n) };
                let a_row = &a[row * k..(row + 1) * k];
                for (col, slot) in dst.iter_mut().enumerate() {
                    *slot = simd::dot(a_row, &bt_ref[col * k..(col + 1) * k]);
                }
            };
            runtime::run_jobs(if parallel { workers } else { 1 }, m, row_job);
        }
        Tensor::new(out, &out_shape)
    }

    /// `y[..., o] = sum_i x[..., i] * w[o, i] (+ b[o])`.
    pub fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        if weight.rank() != 2 {
            return Err(Error::RankMismatch { op: "linear", expected: 2, got: weight.rank() });
        }
        let (out_dim, in_dim) = (weight.shape[0], weight.shape[1]);
        let last = *self
            .shape
            .last()
            .ok_or_else(|| Error::invalid("linear", "scalar input"))?;
        if last != in_dim {
            return Err(Error::ShapeMismatch {
                op: "linear",
                expected: vec![out_dim, last],
                got: weight.shape.clone(),
            });
        }
        if let Some(b) = bias {
            if b.elem_count() != out_dim {
                return Err(Error::ShapeMismatch {
                    op: "linear",
                    expected: vec![out_dim],
                    got: b.shape.clone(),
                });
            }
        }
        let rows = self.elem_count() / in_dim;
        let mut out_shape = self.shape.clone();
        *out_shape.last_mut().unwrap() = out_dim;
        let mut out = vec![0.0; rows * out_dim];

        let workers = runtime::tensor_workers();
        let fmas = rows * out_dim * in_dim;
        let ptr = SendPtr(out.as_mut_ptr());
        let x = &self.data[..];
        let w = &weight.data[..];

        if rows == 1 {
            // Single row: fan out across output channels instead.
            let par = workers > 1 && out_dim > 1 && fmas >= LINEAR_PAR_THRESHOLD;
            runtime::run_jobs(if par { workers } else { 1 }, out_dim, |o| {
                let dst = unsafe { ptr.slice_mut(o, 1) };
                let mut v = simd::dot(x, &w[o * in_dim..(o + 1) * in_dim]);
                if let Some(b) = bias {
                    v += b.data[o];
                }
                dst[0] = v;
            });
        } else {
            let par = workers > 1 && fmas >= LINEAR_PAR_THRESHOLD;
            runtime::run_jobs(if par { workers } else { 1 }, rows, |r| {
                let dst = unsafe { ptr.slice_mut(r * out_dim, out_dim) };
                let x_row = &x[r * in_dim..(r + 1) * in_dim];
                for (o, slot) in dst.iter_mut().enumerate() {
                    let mut v = simd::dot(x_row, &w[o * in_dim..(o + 1) * in_dim]);
                    if let Some(b) = bias {
                        v += b.data[o];
                    }
                    *slot = v;
                }
            });
        }
        Tensor::new(out, &out_shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::new(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn reshape_shares_and_validates() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = a.reshape(&[3, 2]).unwrap();
        assert_eq!(b.shape(), &[3, 2]);
        assert_eq!(b.data(), a.data());
        assert!(a.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn scalar_shape_has_one_element() {
        let s = Tensor::scalar(3.5);
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.data(), &[3.5]);
    }

    #[test]
    fn reshape_then_write_does_not_alias() {
        let a = t(&[1.0, 2.0], &[2]);
        let mut b = a.reshape(&[1, 2]).unwrap();
        b.data_mut()[0] = 9.0;
        assert_eq!(a.data()[0], 1.0);
    }

    #[test]
    fn narrow_middle_dim() {
        let a = t(&(0..24).map(|v| v as f32).collect::<Vec<_>>(), &[2, 3, 4]);
        let b = a.narrow(1, 1, 2).unwrap();
        assert_eq!(b.shape(), &[2, 2, 4]);
        assert_eq!(&b.data()[..4], &[4.0, 5.0, 6.0, 7.0]);
        assert!(a.narrow(1, 2, 2).is_err());
    }

    #[test]
    fn negative_dims_normalize() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = a.narrow(-1, 1, 1).unwrap();
        assert_eq!(b.shape(), &[2, 1]);
        assert_eq!(b.data(), &[2.0, 4.0]);
        assert!(a.narrow(-3, 0, 1).is_err());
    }

    #[test]
    fn gather_rows_bounds_checked() {
        let a = t(&(0..12).map(|v| v as f32).collect::<Vec<_>>(), &[4, 3]);
        let b = a.gather(0, &[2, 0]).unwrap();
        assert_eq!(b.shape(), &[2, 3]);
        assert_eq!(b.data(), &[6.0, 7.0, 8.0, 0.0, 1.0, 2.0]);
        assert!(a.gather(0, &[4]).is_err());
    }

    #[test]
    fn transpose_round_trips() {
        let a = t(&(0..24).map(|v| v as f32).collect::<Vec<_>>(), &[2, 3, 4]);
        for (d1, d2) in [(0, 1), (0, 2), (1, 2), (-1, 0)] {
            let b = a.transpose(d1, d2).unwrap().transpose(d1, d2).unwrap();
            assert_eq!(b.shape(), a.shape());
            assert_eq!(b.data(), a.data());
        }
    }

    #[test]
    fn transpose_swaps_layout() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = a.transpose(0, 1).unwrap();
        assert_eq!(b.shape(), &[3, 2]);
        assert_eq!(b.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn concat_validates_shapes() {
        let a = t(&[1.0, 2.0], &[1, 2]);
        let b = t(&[3.0, 4.0], &[1, 2]);
        let c = Tensor::concat(&[&a, &b], 0).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        let d = Tensor::concat(&[&a, &b], 1).unwrap();
        assert_eq!(d.shape(), &[1, 4]);
        assert_eq!(d.data(), &[1.0, 2.0, 3.0, 4.0]);
        let bad = t(&[1.0, 2.0, 3.0], &[1, 3]);
        assert!(Tensor::concat(&[&a, &bad], 0).is_err());
        assert!(Tensor::concat(&[], 0).is_err());
    }

    #[test]
    fn broadcast_add_last_dim() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let v = t(&[10.0, 20.0], &[2]);
        let c = a.broadcast_add(&v).unwrap();
        assert_eq!(c.data(), &[11.0, 22.0, 13.0, 24.0]);
        let bad = t(&[1.0, 2.0, 3.0], &[3]);
        assert!(a.broadcast_add(&bad).is_err());
    }

    #[test]
    fn broadcast_mul_leading_dim() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let col = t(&[2.0, 3.0], &[2, 1]);
        let c = a.broadcast_mul(&col).unwrap();
        assert_eq!(c.data(), &[2.0, 4.0, 9.0, 12.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let a = t(&[1.0, 2.0, 3.0, 50.0, 60.0, 70.0], &[2, 3]);
        let s = a.softmax(-1).unwrap();
        for r in 0..2 {
            let sum: f32 = s.data()[r * 3..(r + 1) * 3].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            assert!(s.data()[r * 3..(r + 1) * 3].iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn softmax_is_shift_stable() {
        let a = t(&[1000.0, 1001.0], &[2]);
        let s = a.softmax(0).unwrap();
        assert!((s.data()[0] + s.data()[1] - 1.0).abs() < 1e-6);
        assert!(s.data()[1] > s.data()[0]);
    }

    #[test]
    fn softmax_nan_sum_is_an_error() {
        let a = t(&[f32::NAN, 0.0], &[2]);
        assert!(matches!(a.softmax(0), Err(Error::SoftmaxNormalization)));
    }

    #[test]
    fn layer_norm_population_variance() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);
        let y = a.layer_norm(None, None, 0.0).unwrap();
        // mean 2.5, population var 1.25
        let inv = 1.0 / 1.25f32.sqrt();
        let want: Vec<f32> = [-1.5, -0.5, 0.5, 1.5].iter().map(|v| v * inv).collect();
        for (g, w) in y.data().iter().zip(&want) {
            assert!((g - w).abs() < 1e-5);
        }
        let mean: f32 = y.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
    }

    #[test]
    fn layer_norm_affine() {
        let a = t(&[0.0, 2.0], &[1, 2]);
        let w = t(&[2.0, 2.0], &[2]);
        let b = t(&[1.0, -1.0], &[2]);
        let y = a.layer_norm(Some(&w), Some(&b), 0.0).unwrap();
        assert!((y.data()[0] - (-1.0)).abs() < 1e-5);
        assert!((y.data()[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn matmul_rank2() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_broadcasts_leading_dims() {
        let a = t(&(0..12).map(|v| v as f32).collect::<Vec<_>>(), &[2, 2, 3]);
        let b = t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2, 2]);
        // first batch, first row: [0,1,2] -> [0*1+1*0+2*1, 0*0+1*1+2*1]
        assert_eq!(&c.data()[..2], &[2.0, 3.0]);
    }

    #[test]
    fn matmul_inner_dim_mismatch() {
        let a = t(&[1.0, 2.0], &[1, 2]);
        let b = t(&[1.0, 2.0, 3.0], &[3, 1]);
        assert!(a.matmul(&b).is_err());
    }

    #[test]
    fn linear_matches_explicit_matmul() {
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let w = t(&[1.0, 0.5, -1.0, 2.0, 0.0, 1.0], &[3, 2]);
        let b = t(&[0.1, 0.2, 0.3], &[3]);
        let y = x.linear(&w, Some(&b)).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        let wt = w.transpose(0, 1).unwrap();
        let want = x.matmul(&wt).unwrap().broadcast_add(&b).unwrap();
        for (g, w) in y.data().iter().zip(want.data()) {
            assert!((g - w).abs() < 1e-4);
        }
    }

    #[test]
    fn linear_preserves_leading_dims() {
        let x = Tensor::zeros(&[2, 3, 4]);
        let w = Tensor::zeros(&[5, 4]);
        let y = x.linear(&w, None).unwrap();
        assert_eq!(y.shape(), &[2, 3, 5]);
    }

    #[test]
    fn parallel_linear_matches_sequential() {
        let rows = 64;
        let (din, dout) = (128, 96);
        let x = t(
            &(0..rows * din).map(|v| ((v % 97) as f32 - 48.0) * 0.01).collect::<Vec<_>>(),
            &[rows, din],
        );
        let w = t(
            &(0..dout * din).map(|v| ((v % 53) as f32 - 26.0) * 0.02).collect::<Vec<_>>(),
            &[dout, din],
        );
        let seq = x.linear(&w, None).unwrap();
        runtime::set_tensor_workers(4);
        let par = x.linear(&w, None).unwrap();
        runtime::set_tensor_workers(1);
        for (a, b) in seq.data().iter().zip(par.data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
