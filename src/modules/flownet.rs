//! Flow-matching network: the timestep-conditioned residual MLP that
//! turns noise into the next latent frame, one short Euler integration
//! per generation step.

use crate::error::{Error, Result};
use crate::modules::activations::{add, mlp_silu, modulate, mul, rms_norm_with_alpha, scale, silu};
use crate::tensor::Tensor;
use crate::weights::VarBuilder;

const LN_EPS: f32 = 1e-5;
const RES_LN_EPS: f32 = 1e-6;

/// Sinusoidal timestep embedder: `t * freqs` -> `[cos, sin]` -> two-layer
/// SiLU MLP -> RMS norm with a learned scale. The RMS norm divides by
/// N - 1, unlike the transformer layer-norms; the two conventions
/// coexist deliberately.
#[derive(Debug)]
pub struct TimestepEmbedder {
    freqs: Tensor,
    w1: Tensor,
    b1: Tensor,
    w2: Tensor,
    b2: Tensor,
    alpha: Tensor,
}

impl TimestepEmbedder {
    pub fn load(vb: &VarBuilder) -> Result<Self> {
        let freqs = vb.get_any("freqs")?;
        let mlp = vb.pp("mlp");
        Ok(Self {
            freqs,
            w1: mlp.pp("0").get_any("weight")?,
            b1: mlp.pp("0").get_any("bias")?,
            w2: mlp.pp("2").get_any("weight")?,
            b2: mlp.pp("2").get_any("bias")?,
            alpha: mlp.pp("3").get_any("alpha")?,
        })
    }

    /// `t [B, 1]` -> `[B, hidden]`.
    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let args = t.broadcast_mul(&self.freqs)?;
        let cos = Tensor::new(args.data().iter().map(|v| v.cos()).collect(), args.shape())?;
        let sin = Tensor::new(args.data().iter().map(|v| v.sin()).collect(), args.shape())?;
        let emb = Tensor::concat(&[&cos, &sin], -1)?;
        let h = mlp_silu(&emb, &self.w1, Some(&self.b1), &self.w2, Some(&self.b2))?;
        rms_norm_with_alpha(&h, &self.alpha, LN_EPS)
    }
}

/// Residual block with adaptive layer-norm modulation: the conditioning
/// vector is mapped (after SiLU) to `(shift, scale, gate)` and gates a
/// SiLU MLP around a modulated layer-norm.
#[derive(Debug)]
struct ResBlock {
    in_ln_weight: Tensor,
    in_ln_bias: Tensor,
    w1: Tensor,
    b1: Tensor,
    w2: Tensor,
    b2: Tensor,
    ada_weight: Tensor,
    ada_bias: Tensor,
}

impl ResBlock {
    fn load(vb: &VarBuilder) -> Result<Self> {
        let ada = vb.pp("adaLN_modulation").pp("1");
        Ok(Self {
            in_ln_weight: vb.pp("in_ln").get_any("weight")?,
            in_ln_bias: vb.pp("in_ln").get_any("bias")?,
            w1: vb.pp("mlp").pp("0").get_any("weight")?,
            b1: vb.pp("mlp").pp("0").get_any("bias")?,
            w2: vb.pp("mlp").pp("2").get_any("weight")?,
            b2: vb.pp("mlp").pp("2").get_any("bias")?,
            ada_weight: ada.get_any("weight")?,
            ada_bias: ada.get_any("bias")?,
        })
    }

    fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let hidden = x.dim(-1)?;
        let ada = silu(cond).linear(&self.ada_weight, Some(&self.ada_bias))?;
        let shift = ada.narrow(-1, 0, hidden)?;
        let scale_t = ada.narrow(-1, hidden, hidden)?;
        let gate = ada.narrow(-1, 2 * hidden, hidden)?;

        let h = x.layer_norm(Some(&self.in_ln_weight), Some(&self.in_ln_bias), RES_LN_EPS)?;
        let h = modulate(&h, &shift, &scale_t)?;
        let h = mlp_silu(&h, &self.w1, Some(&self.b1), &self.w2, Some(&self.b2))?;
        add(x, &mul(&h, &gate)?)
    }
}

/// Final projection: parameter-free layer-norm, `(shift, scale)`
/// modulation, then a linear map down to the latent width.
#[derive(Debug)]
struct FinalLayer {
    ada_weight: Tensor,
    ada_bias: Tensor,
    linear_weight: Tensor,
    linear_bias: Tensor,
}

impl FinalLayer {
    fn load(vb: &VarBuilder) -> Result<Self> {
        let ada = vb.pp("adaLN_modulation").pp("1");
        Ok(Self {
            ada_weight: ada.get_any("weight")?,
            ada_bias: ada.get_any("bias")?,
            linear_weight: vb.pp("linear").get_any("weight")?,
            linear_bias: vb.pp("linear").get_any("bias")?,
        })
    }

    fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let hidden = x.dim(-1)?;
        let ada = silu(cond).linear(&self.ada_weight, Some(&self.ada_bias))?;
        let shift = ada.narrow(-1, 0, hidden)?;
        let scale_t = ada.narrow(-1, hidden, hidden)?;
        let h = x.layer_norm(None, None, RES_LN_EPS)?;
        let h = modulate(&h, &shift, &scale_t)?;
        h.linear(&self.linear_weight, Some(&self.linear_bias))
    }
}

/// The flow network proper. Weight paths live under `flow_net.*`:
/// two timestep embedders, a condition embedder, an input projection,
/// residual blocks scanned from 0, and the final layer.
#[derive(Debug)]
pub struct FlowNet {
    cond_weight: Tensor,
    cond_bias: Tensor,
    input_weight: Tensor,
    input_bias: Tensor,
    time_embed: [TimestepEmbedder; 2],
    res_blocks: Vec<ResBlock>,
    final_layer: FinalLayer,
}

impl FlowNet {
    pub fn load(vb: &VarBuilder) -> Result<Self> {
        let time_embed = [
            TimestepEmbedder::load(&vb.pp("time_embed").pp("0"))?,
            TimestepEmbedder::load(&vb.pp("time_embed").pp("1"))?,
        ];
        let mut res_blocks = Vec::new();
        loop {
            let block = vb.pp("res_blocks").pp(res_blocks.len().to_string());
            if !block.pp("in_ln").contains("weight") {
                break;
            }
            res_blocks.push(ResBlock::load(&block)?);
        }
        if res_blocks.is_empty() {
            return Err(Error::TensorNotFound(vb.full_name("res_blocks.0.in_ln.weight")));
        }
        log::debug!("flow_net: {} residual blocks", res_blocks.len());
        Ok(Self {
            cond_weight: vb.pp("cond_embed").get_any("weight")?,
            cond_bias: vb.pp("cond_embed").get_any("bias")?,
            input_weight: vb.pp("input_proj").get_any("weight")?,
            input_bias: vb.pp("input_proj").get_any("bias")?,
            time_embed,
            res_blocks,
            final_layer: FinalLayer::load(&vb.pp("final_layer"))?,
        })
    }

    /// Flow direction at `(s, t)`: `c [B, cond]`, `s, t [B, 1]`,
    /// `x [B, latent]` -> `[B, latent]`.
    pub fn forward(&self, c: &Tensor, s: &Tensor, t: &Tensor, x: &Tensor) -> Result<Tensor> {
        let mut h = x.linear(&self.input_weight, Some(&self.input_bias))?;
        let t_emb = scale(&add(&self.time_embed[0].forward(s)?, &self.time_embed[1].forward(t)?)?, 0.5);
        let cond = add(&t_emb, &c.linear(&self.cond_weight, Some(&self.cond_bias))?)?;
        for block in &self.res_blocks {
            h = block.forward(&h, &cond)?;
        }
        self.final_layer.forward(&h, &cond)
    }

    /// Euler integration from `x0` over `steps` uniform substeps.
    pub fn lsd_decode(&self, cond: &Tensor, x0: &Tensor, steps: usize) -> Result<Tensor> {
        if steps == 0 {
            return Err(Error::invalid("lsd_decode", "steps must be positive"));
        }
        let batch = x0.dim(0)?;
        let dt = 1.0 / steps as f32;
        let mut current = x0.clone();
        for i in 0..steps {
            let s = Tensor::full(i as f32 * dt, &[batch, 1]);
            let t = Tensor::full((i + 1) as f32 * dt, &[batch, 1]);
            let flow = self.forward(cond, &s, &t, &current)?;
            current = add(&current, &scale(&flow, dt))?;
        }
        Ok(current)
    }
}
