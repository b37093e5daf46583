//! 1-D convolution and transposed convolution.
//!
//! Conv1d lowers to an im2col patch matrix and per-channel dot products;
//! ConvTranspose1d repacks its weight to `[K, Cout, Cin]` once at load
//! and scatters dot products into the output. Both fan out across output
//! channels on the conv-worker knob. The streaming wrappers implement
//! the causal left-pad / right-trim forms the decoder tower uses.

use crate::error::{Error, Result};
use crate::runtime::{self, SendPtr};
use crate::tensor::{pool, simd, Tensor};

fn conv_out_len(l: usize, pad: usize, dilation: usize, k: usize, stride: usize) -> Result<usize> {
    let eff_k = dilation * (k - 1) + 1;
    let padded = l + 2 * pad;
    if padded < eff_k {
        return Err(Error::invalid(
            "conv1d",
            format!("non-positive output length: input {l}, padding {pad}, effective kernel {eff_k}"),
        ));
    }
    Ok((padded - eff_k) / stride + 1)
}

/// `x [B, Cin, L]`, `weight [Cout, Cin/G, K]` -> `[B, Cout, Lout]`.
pub fn conv1d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
    dilation: usize,
    groups: usize,
) -> Result<Tensor> {
    if x.rank() != 3 || weight.rank() != 3 {
        return Err(Error::RankMismatch { op: "conv1d", expected: 3, got: x.rank().min(weight.rank()) });
    }
    if stride == 0 || dilation == 0 || groups == 0 {
        return Err(Error::invalid("conv1d", "stride, dilation and groups must be positive"));
    }
    let (b, cin, l) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let (cout, wcin, k) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
    if cin % groups != 0 || cout % groups != 0 || wcin != cin / groups {
        return Err(Error::invalid(
            "conv1d",
            format!("groups {groups} incompatible with channels in={cin} out={cout} (weight {wcin})"),
        ));
    }
    if let Some(bias) = bias {
        if bias.elem_count() != cout {
            return Err(Error::ShapeMismatch { op: "conv1d", expected: vec![cout], got: bias.shape().to_vec() });
        }
    }
    let lout = conv_out_len(l, padding, dilation, k, stride)?;

    let mut out = vec![0.0f32; b * cout * lout];
    let wdata = weight.data();
    let xdata = x.data();

    if groups == 1 {
        let workers = runtime::conv_workers();
        let row = cin * k;
        for bi in 0..b {
            // Patch matrix: patches[ox] = x[ic, ox*stride - pad + kx*dil] over (ic, kx).
            let mut patches = pool::get_scratch(lout * row);
            let x_base = bi * cin * l;
            for ox in 0..lout {
                let dst = &mut patches[ox * row..(ox + 1) * row];
                for ic in 0..cin {
                    for kx in 0..k {
                        let pos = ox * stride + kx * dilation;
                        if pos >= padding && pos - padding < l {
                            dst[ic * k + kx] = xdata[x_base + ic * l + (pos - padding)];
                        }
                    }
                }
            }
            let out_base = bi * cout * lout;
            let ptr = SendPtr(out.as_mut_ptr());
            let patches_ref: &[f32] = &patches;
            runtime::run_jobs(if workers > 1 && cout > 1 { workers } else { 1 }, cout, |oc| {
                let dst = unsafe { ptr.slice_mut(out_base + oc * lout, lout) };
                let w_row = &wdata[oc * row..(oc + 1) * row];
                let b0 = bias.map(|t| t.data()[oc]).unwrap_or(0.0);
                for (ox, slot) in dst.iter_mut().enumerate() {
                    *slot = simd::dot(w_row, &patches_ref[ox * row..(ox + 1) * row]) + b0;
                }
            });
        }
    } else {
        // Grouped scalar path.
        let gcin = cin / groups;
        let gcout = cout / groups;
        for bi in 0..b {
            for oc in 0..cout {
                let g = oc / gcout;
                let b0 = bias.map(|t| t.data()[oc]).unwrap_or(0.0);
                for ox in 0..lout {
                    let mut acc = b0;
                    for ic in 0..gcin {
                        let xin = bi * cin * l + (g * gcin + ic) * l;
                        for kx in 0..k {
                            let pos = ox * stride + kx * dilation;
                            if pos >= padding && pos - padding < l {
                                acc += wdata[(oc * gcin + ic) * k + kx] * xdata[xin + pos - padding];
                            }
                        }
                    }
                    out[(bi * cout + oc) * lout + ox] = acc;
                }
            }
        }
    }
    Tensor::new(out, &[b, cout, lout])
}

fn convtr_out_len(
    l: usize,
    stride: usize,
    pad: usize,
    dilation: usize,
    k: usize,
    output_padding: usize,
) -> Result<usize> {
    let full = (l - 1) * stride + dilation * (k - 1) + output_padding + 1;
    if full <= 2 * pad {
        return Err(Error::invalid(
            "conv_transpose1d",
            format!("non-positive output length: input {l}, padding {pad}"),
        ));
    }
    Ok(full - 2 * pad)
}

/// Repacks `weight [Cin, Cout, K]` (groups == 1) to `[K, Cout, Cin]` so
/// each scatter step is one contiguous dot against an input row.
pub fn pack_convtr_weight(weight: &Tensor) -> Result<Vec<f32>> {
    if weight.rank() != 3 {
        return Err(Error::RankMismatch { op: "conv_transpose1d", expected: 3, got: weight.rank() });
    }
    let (cin, cout, k) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
    let w = weight.data();
    let mut packed = vec![0.0f32; k * cout * cin];
    for ic in 0..cin {
        for oc in 0..cout {
            for kx in 0..k {
                packed[(kx * cout + oc) * cin + ic] = w[(ic * cout + oc) * k + kx];
            }
        }
    }
    Ok(packed)
}

#[allow(clippy::too_many_arguments)]
fn conv_transpose1d_packed(
    x: &Tensor,
    packed: &[f32],
    shape: (usize, usize, usize),
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
    output_padding: usize,
    dilation: usize,
) -> Result<Tensor> {
    let (cin, cout, k) = shape;
    let (b, xc, l) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    if xc != cin {
        return Err(Error::ShapeMismatch { op: "conv_transpose1d", expected: vec![cin], got: vec![xc] });
    }
    let lout = convtr_out_len(l, stride, padding, dilation, k, output_padding)?;
    let mut out = vec![0.0f32; b * cout * lout];
    let xdata = x.data();
    let workers = runtime::conv_workers();

    for bi in 0..b {
        // Transpose the input block to [L, Cin] so each (oc, kx, ix)
        // contribution is a contiguous dot.
        let mut xt = pool::get_scratch(l * cin);
        let x_base = bi * cin * l;
        for ic in 0..cin {
            for ix in 0..l {
                xt[ix * cin + ic] = xdata[x_base + ic * l + ix];
            }
        }
        let out_base = bi * cout * lout;
        let ptr = SendPtr(out.as_mut_ptr());
        let xt_ref: &[f32] = &xt;
        runtime::run_jobs(if workers > 1 && cout > 1 { workers } else { 1 }, cout, |oc| {
            let dst = unsafe { ptr.slice_mut(out_base + oc * lout, lout) };
            for kx in 0..k {
                let w_row = &packed[(kx * cout + oc) * cin..(kx * cout + oc + 1) * cin];
                for ix in 0..l {
                    let opos = ix * stride + kx * dilation;
                    if opos >= padding && opos - padding < lout {
                        dst[opos - padding] += simd::dot(w_row, &xt_ref[ix * cin..(ix + 1) * cin]);
                    }
                }
            }
            if let Some(bias) = bias {
                let b0 = bias.data()[oc];
                for slot in dst.iter_mut() {
                    *slot += b0;
                }
            }
        });
    }
    Tensor::new(out, &[b, cout, lout])
}

/// `x [B, Cin, L]`, `weight [Cin, Cout/G, K]` -> `[B, Cout, Lout]` with
/// `Lout = (L-1)*stride - 2*pad + dil*(K-1) + out_pad + 1`.
#[allow(clippy::too_many_arguments)]
pub fn conv_transpose1d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: usize,
    padding: usize,
    output_padding: usize,
    dilation: usize,
    groups: usize,
) -> Result<Tensor> {
    if x.rank() != 3 || weight.rank() != 3 {
        return Err(Error::RankMismatch {
            op: "conv_transpose1d",
            expected: 3,
            got: x.rank().min(weight.rank()),
        });
    }
    if stride == 0 || dilation == 0 || groups == 0 {
        return Err(Error::invalid("conv_transpose1d", "stride, dilation and groups must be positive"));
    }
    if output_padding >= stride {
        return Err(Error::invalid(
            "conv_transpose1d",
            format!("output_padding {output_padding} must be < stride {stride}"),
        ));
    }
    let (b, cin, l) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let (wcin, gcout, k) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
    if wcin != cin || cin % groups != 0 {
        return Err(Error::invalid(
            "conv_transpose1d",
            format!("groups {groups} incompatible with in-channels {cin} (weight {wcin})"),
        ));
    }
    let cout = gcout * groups;
    if let Some(bias) = bias {
        if bias.elem_count() != cout {
            return Err(Error::ShapeMismatch {
                op: "conv_transpose1d",
                expected: vec![cout],
                got: bias.shape().to_vec(),
            });
        }
    }

    if groups == 1 {
        let packed = pack_convtr_weight(weight)?;
        return conv_transpose1d_packed(
            x,
            &packed,
            (cin, cout, k),
            bias,
            stride,
            padding,
            output_padding,
            dilation,
        );
    }

    let lout = convtr_out_len(l, stride, padding, dilation, k, output_padding)?;
    let mut out = vec![0.0f32; b * cout * lout];
    let xdata = x.data();
    let wdata = weight.data();

    if groups == cin && gcout == 1 {
        // Depthwise fast path: each channel scatters independently.
        for bi in 0..b {
            for c in 0..cin {
                let x_row = &xdata[(bi * cin + c) * l..(bi * cin + c + 1) * l];
                let o_row = &mut out[(bi * cout + c) * lout..(bi * cout + c + 1) * lout];
                for kx in 0..k {
                    let w0 = wdata[c * k + kx];
                    for (ix, &xv) in x_row.iter().enumerate() {
                        let opos = ix * stride + kx * dilation;
                        if opos >= padding && opos - padding < lout {
                            o_row[opos - padding] += w0 * xv;
                        }
                    }
                }
            }
        }
    } else {
        // General grouped scalar loop.
        let gcin = cin / groups;
        for bi in 0..b {
            for g in 0..groups {
                for ic in 0..gcin {
                    let x_row = &xdata[(bi * cin + g * gcin + ic) * l..(bi * cin + g * gcin + ic + 1) * l];
                    for oc in 0..gcout {
                        let o_row_base = (bi * cout + g * gcout + oc) * lout;
                        for kx in 0..k {
                            let w0 = wdata[((g * gcin + ic) * gcout + oc) * k + kx];
                            for (ix, &xv) in x_row.iter().enumerate() {
                                let opos = ix * stride + kx * dilation;
                                if opos >= padding && opos - padding < lout {
                                    out[o_row_base + opos - padding] += w0 * xv;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    if let Some(bias) = bias {
        for bi in 0..b {
            for oc in 0..cout {
                let b0 = bias.data()[oc];
                for slot in &mut out[(bi * cout + oc) * lout..(bi * cout + oc + 1) * lout] {
                    *slot += b0;
                }
            }
        }
    }
    Tensor::new(out, &[b, cout, lout])
}

/// Plain Conv1d layer holding its weights.
#[derive(Debug)]
pub struct Conv1d {
    weight: Tensor,
    bias: Option<Tensor>,
    stride: usize,
    padding: usize,
    dilation: usize,
    groups: usize,
}

impl Conv1d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, stride: usize, padding: usize) -> Self {
        Self { weight, bias, stride, padding, dilation: 1, groups: 1 }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        conv1d(x, &self.weight, self.bias.as_ref(), self.stride, self.padding, self.dilation, self.groups)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.shape()[2]
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn groups(&self) -> usize {
        self.groups
    }
}

/// Causal Conv1d: zero-pads `max(effective_kernel - stride, 0)` samples
/// on the left only, preserving the streaming length relationship.
#[derive(Debug)]
pub struct Conv1dLeftPad {
    inner: Conv1d,
    left_pad: usize,
}

impl Conv1dLeftPad {
    pub fn new(weight: Tensor, bias: Option<Tensor>, stride: usize) -> Self {
        let k = weight.shape()[2];
        let left_pad = k.saturating_sub(stride);
        Self { inner: Conv1d::new(weight, bias, stride, 0), left_pad }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.left_pad == 0 {
            return self.inner.forward(x);
        }
        let (b, c) = (x.dim(0)?, x.dim(1)?);
        let zeros = Tensor::zeros(&[b, c, self.left_pad]);
        let padded = Tensor::concat(&[&zeros, x], -1)?;
        self.inner.forward(&padded)
    }

    pub fn left_pad(&self) -> usize {
        self.left_pad
    }
}

/// Transposed Conv1d with the weight repacked once at construction
/// (groups == 1) and a streaming form that trims the trailing
/// `K - stride` samples so `L_out = L_in * stride`.
#[derive(Debug)]
pub struct ConvTranspose1d {
    weight: Tensor,
    packed: Option<Vec<f32>>,
    bias: Option<Tensor>,
    stride: usize,
    groups: usize,
}

impl ConvTranspose1d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, stride: usize, groups: usize) -> Result<Self> {
        let packed = if groups == 1 { Some(pack_convtr_weight(&weight)?) } else { None };
        Ok(Self { weight, packed, bias, stride, groups })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.packed {
            Some(packed) => {
                let (cin, gcout, k) = (self.weight.shape()[0], self.weight.shape()[1], self.weight.shape()[2]);
                conv_transpose1d_packed(x, packed, (cin, gcout, k), self.bias.as_ref(), self.stride, 0, 0, 1)
            }
            None => conv_transpose1d(x, &self.weight, self.bias.as_ref(), self.stride, 0, 0, 1, self.groups),
        }
    }

    /// Causal streaming form: full transposed conv, then drop the last
    /// `K - stride` samples.
    pub fn forward_streaming(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.forward(x)?;
        let k = self.weight.shape()[2];
        let trim = k.saturating_sub(self.stride);
        if trim == 0 {
            return Ok(y);
        }
        let lout = y.dim(2)?;
        if lout <= trim {
            return Err(Error::invalid("conv_transpose1d", "output shorter than streaming trim"));
        }
        y.narrow(2, 0, lout - trim)
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.shape()[2]
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}
