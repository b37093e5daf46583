//! Pointwise activations and the small tensor helpers the model layers
//! lean on.

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Abramowitz–Stegun 7.1.26 rational approximation, |err| < 1.5e-7.
fn erf(x: f32) -> f32 {
    const A1: f32 = 0.254829592;
    const A2: f32 = -0.284496736;
    const A3: f32 = 1.421413741;
    const A4: f32 = -1.453152027;
    const A5: f32 = 1.061405429;
    const P: f32 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

fn silu_scalar(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn gelu_erf_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2))
}

fn elu_scalar(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        x.exp() - 1.0
    }
}

fn map(x: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    let data = x.data().iter().map(|&v| f(v)).collect();
    Tensor::new(data, x.shape()).expect("same shape")
}

pub fn silu(x: &Tensor) -> Tensor {
    map(x, silu_scalar)
}

pub fn gelu_erf(x: &Tensor) -> Tensor {
    map(x, gelu_erf_scalar)
}

pub fn gelu_erf_in_place(x: &mut Tensor) {
    for v in x.data_mut() {
        *v = gelu_erf_scalar(*v);
    }
}

pub fn elu(x: &Tensor) -> Tensor {
    map(x, elu_scalar)
}

pub fn elu_in_place(x: &mut Tensor) {
    for v in x.data_mut() {
        *v = elu_scalar(*v);
    }
}

fn check_same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            op,
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape("add", a, b)?;
    let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
    Tensor::new(data, a.shape())
}

pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_shape("mul", a, b)?;
    let data = a.data().iter().zip(b.data()).map(|(x, y)| x * y).collect();
    Tensor::new(data, a.shape())
}

pub fn scale(x: &Tensor, s: f32) -> Tensor {
    map(x, |v| v * s)
}

pub fn add_scalar(x: &Tensor, s: f32) -> Tensor {
    map(x, |v| v + s)
}

/// `x * (1 + scale) + shift`, broadcasting `shift`/`scale` over the last
/// dimension the way adaptive layer-norm modulation expects.
pub fn modulate(x: &Tensor, shift: &Tensor, scale: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(&add_scalar(scale, 1.0))?.broadcast_add(shift)
}

/// Multiplies every last-dim row of `x` by the vector `v` in place.
pub fn mul_last_dim_in_place(x: &mut Tensor, v: &[f32]) -> Result<()> {
    let n = *x
        .shape()
        .last()
        .ok_or_else(|| Error::invalid("mul_last_dim", "scalar input"))?;
    if v.len() != n {
        return Err(Error::ShapeMismatch {
            op: "mul_last_dim",
            expected: vec![n],
            got: vec![v.len()],
        });
    }
    for row in x.data_mut().chunks_mut(n) {
        for (slot, s) in row.iter_mut().zip(v) {
            *slot *= s;
        }
    }
    Ok(())
}

/// Replaces every NaN element of `x` with the element of `v` at the same
/// last-dim position. Used for the BOS sentinel frame.
pub fn replace_nan_with_vector(x: &mut Tensor, v: &[f32]) -> Result<()> {
    let n = *x
        .shape()
        .last()
        .ok_or_else(|| Error::invalid("replace_nan", "scalar input"))?;
    if v.len() != n {
        return Err(Error::ShapeMismatch {
            op: "replace_nan",
            expected: vec![n],
            got: vec![v.len()],
        });
    }
    for row in x.data_mut().chunks_mut(n) {
        for (slot, &fill) in row.iter_mut().zip(v) {
            if slot.is_nan() {
                *slot = fill;
            }
        }
    }
    Ok(())
}

/// RMS norm over the last dim with a learned scale, using the
/// Bessel-corrected divisor (N - 1). The ordinary `layer_norm` divides by
/// N; the timestep-embedding path requires this variant and the two must
/// not be unified.
pub fn rms_norm_with_alpha(x: &Tensor, alpha: &Tensor, eps: f32) -> Result<Tensor> {
    let n = *x
        .shape()
        .last()
        .ok_or_else(|| Error::invalid("rms_norm", "scalar input"))?;
    if n < 2 {
        return Err(Error::invalid("rms_norm", "last dim must be at least 2"));
    }
    if alpha.elem_count() != n {
        return Err(Error::ShapeMismatch {
            op: "rms_norm",
            expected: vec![n],
            got: alpha.shape().to_vec(),
        });
    }
    let mut out = x.to_vec();
    for row in out.chunks_mut(n) {
        let sumsq: f32 = row.iter().map(|v| v * v).sum();
        let inv = 1.0 / (sumsq / (n - 1) as f32 + eps).sqrt();
        for (slot, a) in row.iter_mut().zip(alpha.data()) {
            *slot *= inv * a;
        }
    }
    Tensor::new(out, x.shape())
}

/// `linear2(silu(linear1(x)))`, the flow-net MLP shape.
pub fn mlp_silu(x: &Tensor, w1: &Tensor, b1: Option<&Tensor>, w2: &Tensor, b2: Option<&Tensor>) -> Result<Tensor> {
    let h = x.linear(w1, b1)?;
    silu(&h).linear(w2, b2)
}
