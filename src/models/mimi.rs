//! Mimi decoder: quantizer projection, depthwise 16x upsample, a small
//! non-causal transformer, and the SEANet convolution tower that turns
//! `[B, 512, T]` latents into a 24 kHz waveform.

use crate::error::{Context, Error, Result};
use crate::modules::activations::{elu_in_place, gelu_erf_in_place, mul_last_dim_in_place};
use crate::modules::attention::SelfAttention;
use crate::modules::conv::{Conv1dLeftPad, ConvTranspose1d};
use crate::modules::rotary::RotaryEmbedding;
use crate::tensor::Tensor;
use crate::weights::VarBuilder;

const LN_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct MimiConfig {
    pub sample_rate: usize,
    pub num_heads: usize,
    pub max_period: f32,
}

impl Default for MimiConfig {
    fn default() -> Self {
        Self { sample_rate: 24000, num_heads: 8, max_period: 10000.0 }
    }
}

/// Pre-norm transformer layer, structurally the FlowLM layer with
/// non-causal attention and optional per-layer affine scales after the
/// attention and MLP halves.
#[derive(Debug)]
struct DecoderTransformerLayer {
    norm1_weight: Tensor,
    norm1_bias: Tensor,
    norm2_weight: Tensor,
    norm2_bias: Tensor,
    attn: SelfAttention,
    linear1: Tensor,
    linear2: Tensor,
    layer_scale_1: Option<Tensor>,
    layer_scale_2: Option<Tensor>,
}

impl DecoderTransformerLayer {
    fn load(vb: &VarBuilder, num_heads: usize) -> Result<Self> {
        let attn = SelfAttention::new(
            vb.pp("self_attn").pp("in_proj").get_any("weight")?,
            vb.pp("self_attn").pp("out_proj").get_any("weight")?,
            num_heads,
        )?;
        Ok(Self {
            norm1_weight: vb.pp("norm1").get_any("weight")?,
            norm1_bias: vb.pp("norm1").get_any("bias")?,
            norm2_weight: vb.pp("norm2").get_any("weight")?,
            norm2_bias: vb.pp("norm2").get_any("bias")?,
            attn,
            linear1: vb.pp("linear1").get_any("weight")?,
            linear2: vb.pp("linear2").get_any("weight")?,
            layer_scale_1: vb.pp("layer_scale_1").get_opt("scale")?,
            layer_scale_2: vb.pp("layer_scale_2").get_opt("scale")?,
        })
    }

    fn forward(&self, x: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
        let h = x.layer_norm(Some(&self.norm1_weight), Some(&self.norm1_bias), LN_EPS)?;
        let mut h = self.attn.forward(&h, Some(rope), None, 0, false)?;
        if let Some(scale) = &self.layer_scale_1 {
            mul_last_dim_in_place(&mut h, scale.data())?;
        }
        let x = x.broadcast_add(&h)?;

        let h = x.layer_norm(Some(&self.norm2_weight), Some(&self.norm2_bias), LN_EPS)?;
        let mut h = h.linear(&self.linear1, None)?;
        gelu_erf_in_place(&mut h);
        let mut h = h.linear(&self.linear2, None)?;
        if let Some(scale) = &self.layer_scale_2 {
            mul_last_dim_in_place(&mut h, scale.data())?;
        }
        x.broadcast_add(&h)
    }
}

/// `x + conv2(elu(conv1(elu(x))))`, both convolutions streaming
/// left-padded.
#[derive(Debug)]
struct SeanetResBlock {
    conv1: Conv1dLeftPad,
    conv2: Conv1dLeftPad,
}

impl SeanetResBlock {
    fn load(vb: &VarBuilder) -> Result<Self> {
        let c1 = vb.pp("block").pp("1").pp("conv");
        let c2 = vb.pp("block").pp("3").pp("conv");
        Ok(Self {
            conv1: Conv1dLeftPad::new(c1.get_any("weight")?, c1.get_opt("bias")?, 1),
            conv2: Conv1dLeftPad::new(c2.get_any("weight")?, c2.get_opt("bias")?, 1),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        elu_in_place(&mut h);
        let mut h = self.conv1.forward(&h)?;
        elu_in_place(&mut h);
        let h = self.conv2.forward(&h)?;
        x.broadcast_add(&h)
    }
}

/// Upsampling strides of the decoder tower, outermost first. Together
/// with the 16x quantizer upsample one latent frame becomes
/// `16 * 6 * 5 * 4 = 1920` samples.
const STAGE_STRIDES: [usize; 3] = [6, 5, 4];
const UPSAMPLE_STRIDE: usize = 16;

#[derive(Debug)]
pub struct Mimi {
    sample_rate: usize,
    mimi_dim: usize,
    quantizer_weight: Tensor,
    quantizer_bias: Option<Tensor>,
    upsample: ConvTranspose1d,
    transformer: Vec<DecoderTransformerLayer>,
    rope: RotaryEmbedding,
    init_conv: Conv1dLeftPad,
    stages: Vec<(ConvTranspose1d, SeanetResBlock)>,
    final_conv: Conv1dLeftPad,
}

impl Mimi {
    /// Loads the `mimi.*` subtree: quantizer projection, upsample,
    /// decoder transformer (layers scanned from 0), and the
    /// `decoder.model.{0,2,3,5,6,8,9,11}` conv tower.
    pub fn load(config: &MimiConfig, vb: &VarBuilder) -> Result<Self> {
        let quantizer = vb.pp("quantizer").pp("output_proj");
        let quantizer_weight = quantizer.get_any("weight").context("mimi: quantizer")?;
        let quantizer_bias = quantizer.get_opt("bias")?;
        let mimi_dim = quantizer_weight.shape()[0];

        let up_weight = vb.pp("upsample").pp("convtr").pp("convtr").get_any("weight")?;
        let up_groups = up_weight.shape()[0];
        let upsample = ConvTranspose1d::new(
            up_weight,
            vb.pp("upsample").pp("convtr").pp("convtr").get_opt("bias")?,
            UPSAMPLE_STRIDE,
            up_groups,
        )?;

        if mimi_dim % config.num_heads != 0 {
            return Err(Error::invalid(
                "mimi",
                format!("dim {mimi_dim} not divisible by {} heads", config.num_heads),
            ));
        }
        let mut transformer = Vec::new();
        loop {
            let idx = transformer.len();
            let layer_vb = vb
                .pp("decoder_transformer")
                .pp("transformer")
                .pp("layers")
                .pp(idx.to_string());
            if !layer_vb.pp("norm1").contains("weight") {
                break;
            }
            let layer = DecoderTransformerLayer::load(&layer_vb, config.num_heads)
                .with_context(|| format!("mimi: transformer layer {idx}"))?;
            transformer.push(layer);
        }
        let rope = RotaryEmbedding::new(
            mimi_dim / config.num_heads,
            crate::modules::rotary::MAX_SEQ_LEN,
            config.max_period,
        )?;

        let decoder = vb.pp("decoder").pp("model");
        let init = decoder.pp("0").pp("conv");
        let init_conv = Conv1dLeftPad::new(init.get_any("weight")?, init.get_opt("bias")?, 1);

        let mut stages = Vec::with_capacity(STAGE_STRIDES.len());
        for (i, (&stride, idx)) in STAGE_STRIDES.iter().zip([2usize, 5, 8]).enumerate() {
            let tr = decoder.pp(idx.to_string()).pp("convtr");
            let convtr = ConvTranspose1d::new(tr.get_any("weight")?, tr.get_opt("bias")?, stride, 1)
                .with_context(|| format!("mimi: decoder stage {i}"))?;
            let block = SeanetResBlock::load(&decoder.pp((idx + 1).to_string()))
                .with_context(|| format!("mimi: decoder stage {i} residual"))?;
            stages.push((convtr, block));
        }

        let fin = decoder.pp("11").pp("conv");
        let final_conv = Conv1dLeftPad::new(fin.get_any("weight")?, fin.get_opt("bias")?, 1);

        log::debug!("mimi: dim {mimi_dim}, {} transformer layers, {} stages", transformer.len(), stages.len());
        Ok(Self {
            sample_rate: config.sample_rate,
            mimi_dim,
            quantizer_weight,
            quantizer_bias,
            upsample,
            transformer,
            rope,
            init_conv,
            stages,
            final_conv,
        })
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    pub fn dim(&self) -> usize {
        self.mimi_dim
    }

    /// Output samples produced per input latent frame.
    pub fn samples_per_frame(&self) -> usize {
        STAGE_STRIDES.iter().product::<usize>() * UPSAMPLE_STRIDE
    }

    /// The raw quantizer projection weights; the facade fuses these with
    /// the latent denormalization when the kernel is 1x1.
    pub fn quantizer_weight(&self) -> &Tensor {
        &self.quantizer_weight
    }

    pub fn quantizer_bias(&self) -> Option<&Tensor> {
        self.quantizer_bias.as_ref()
    }

    /// Unfused quantizer projection: `[B, latent, T] -> [B, dim, T]`.
    pub fn quantizer_project(&self, latent: &Tensor) -> Result<Tensor> {
        crate::modules::conv::conv1d(
            latent,
            &self.quantizer_weight,
            self.quantizer_bias.as_ref(),
            1,
            0,
            1,
            1,
        )
        .context("mimi: quantizer_project")
    }

    /// Decodes projected latents `[B, dim, T]` to samples `[B, 1, N]`
    /// with `N = T * 1920`.
    pub fn decode(&self, x: &Tensor) -> Result<Tensor> {
        if x.rank() != 3 || x.dim(1)? != self.mimi_dim {
            return Err(Error::ShapeMismatch {
                op: "mimi_decode",
                expected: vec![self.mimi_dim],
                got: x.shape().to_vec(),
            });
        }
        let x = self.upsample.forward_streaming(x).context("mimi: upsample")?;

        // Transformer wants [B, T, C].
        let mut h = x.transpose(1, 2)?;
        for layer in &self.transformer {
            h = layer.forward(&h, &self.rope).context("mimi: transformer")?;
        }
        let mut x = h.transpose(1, 2)?;

        x = self.init_conv.forward(&x).context("mimi: init conv")?;
        for (i, (convtr, block)) in self.stages.iter().enumerate() {
            elu_in_place(&mut x);
            x = convtr.forward_streaming(&x).with_context(|| format!("mimi: stage {i} upsample"))?;
            x = block.forward(&x).with_context(|| format!("mimi: stage {i} residual"))?;
        }
        elu_in_place(&mut x);
        self.final_conv.forward(&x).context("mimi: final conv")
    }
}
