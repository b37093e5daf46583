//! The complete model: FlowLM + Mimi behind one facade, with the
//! latent-denormalization and 1x1 quantizer projection pre-fused into a
//! single GEMV at load time.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Context, Error, Result};
use crate::runtime::{self, SendPtr};
use crate::tensor::{simd, Tensor};
use crate::weights::{VarBuilder, WeightStore};

use super::flowlm::{FlowLm, FlowLmConfig, FlowLmState};
use super::mimi::{Mimi, MimiConfig};

/// Per-request synthesis parameters.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Hard cap on generated latent frames.
    pub max_steps: usize,
    /// Euler substeps per frame; 1 suits the consistency-distilled
    /// checkpoints.
    pub decode_steps: usize,
    /// The EOS logit must exceed this to stop generation.
    pub eos_threshold: f32,
    pub temperature: f32,
    /// Seeds a dedicated noise stream; `None` uses the deterministic
    /// default stream.
    pub seed: Option<u64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            decode_steps: 1,
            eos_threshold: -4.0,
            temperature: 1.0,
            seed: None,
        }
    }
}

/// Pre-fused denormalization + 1x1 projection:
/// `scaled_w[oc, ic] = w[oc, ic, 0] * emb_std[ic]` and
/// `fused_bias[oc] = bias[oc] + sum_ic w[oc, ic, 0] * emb_mean[ic]`.
/// Rebuilt only on model reload.
#[derive(Debug)]
struct LatentProjector {
    scaled_weight: Vec<f32>,
    fused_bias: Vec<f32>,
    out_channels: usize,
    in_channels: usize,
}

impl LatentProjector {
    fn fuse(weight: &Tensor, bias: Option<&Tensor>, emb_std: &[f32], emb_mean: &[f32]) -> Self {
        let (oc, ic) = (weight.shape()[0], weight.shape()[1]);
        let w = weight.data();
        let mut scaled_weight = vec![0.0f32; oc * ic];
        let mut fused_bias = vec![0.0f32; oc];
        for o in 0..oc {
            let mut acc = bias.map(|b| b.data()[o]).unwrap_or(0.0);
            for i in 0..ic {
                scaled_weight[o * ic + i] = w[o * ic + i] * emb_std[i];
                acc += w[o * ic + i] * emb_mean[i];
            }
            fused_bias[o] = acc;
        }
        Self { scaled_weight, fused_bias, out_channels: oc, in_channels: ic }
    }

    /// `latent [B, T, ic]` -> `[B, oc, T]`, fanning out over output
    /// channels on the conv-worker knob.
    fn project(&self, latent: &Tensor) -> Result<Tensor> {
        let (b, t, ic) = (latent.dim(0)?, latent.dim(1)?, latent.dim(2)?);
        if ic != self.in_channels {
            return Err(Error::ShapeMismatch {
                op: "latent_to_mimi",
                expected: vec![self.in_channels],
                got: vec![ic],
            });
        }
        let oc = self.out_channels;
        let mut out = vec![0.0f32; b * oc * t];
        let src = latent.data();
        let ptr = SendPtr(out.as_mut_ptr());
        let workers = runtime::conv_workers();
        runtime::run_jobs(if workers > 1 && oc > 1 { workers } else { 1 }, oc, |o| {
            let w_row = &self.scaled_weight[o * ic..(o + 1) * ic];
            let b0 = self.fused_bias[o];
            for bi in 0..b {
                let dst = unsafe { ptr.slice_mut((bi * oc + o) * t, t) };
                for (ti, slot) in dst.iter_mut().enumerate() {
                    *slot = simd::dot(w_row, &src[(bi * t + ti) * ic..(bi * t + ti + 1) * ic]) + b0;
                }
            }
        });
        Tensor::new(out, &[b, oc, t])
    }
}

pub struct PocketTts {
    flow_lm: FlowLm,
    mimi: Mimi,
    projector: Option<LatentProjector>,
}

impl PocketTts {
    /// Memory-maps and loads a checkpoint with default configs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_store(WeightStore::open(path)?, &FlowLmConfig::default(), &MimiConfig::default())
    }

    /// Loads from an owned checkpoint image with default configs.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_store(WeightStore::from_bytes(bytes)?, &FlowLmConfig::default(), &MimiConfig::default())
    }

    pub fn from_store(
        store: Arc<WeightStore>,
        flow_config: &FlowLmConfig,
        mimi_config: &MimiConfig,
    ) -> Result<Self> {
        let root = VarBuilder::new(store);
        let flow_lm = FlowLm::load(flow_config, &root.pp("flow_lm")).context("model: flow_lm")?;
        let mimi = Mimi::load(mimi_config, &root.pp("mimi")).context("model: mimi")?;

        // The fused path needs a plain 1x1 ungrouped projection; other
        // checkpoints fall back to denorm + conv.
        let qw = mimi.quantizer_weight();
        let projector = if qw.shape()[2] == 1 && qw.shape()[1] == flow_lm.latent_dim() {
            log::debug!("model: fusing latent denorm into the quantizer projection");
            Some(LatentProjector::fuse(
                qw,
                mimi.quantizer_bias(),
                flow_lm.emb_std().data(),
                flow_lm.emb_mean().data(),
            ))
        } else {
            None
        };
        Ok(Self { flow_lm, mimi, projector })
    }

    pub fn flow_lm(&self) -> &FlowLm {
        &self.flow_lm
    }

    pub fn mimi(&self) -> &Mimi {
        &self.mimi
    }

    pub fn sample_rate(&self) -> usize {
        self.mimi.sample_rate()
    }

    pub fn text_embeddings(&self, token_ids: &[u32]) -> Result<Tensor> {
        self.flow_lm.text_embeddings(token_ids)
    }

    /// Fresh per-request generation state.
    pub fn init_state(&self) -> FlowLmState {
        self.flow_lm.init_state()
    }

    /// Embeds and prefills a text prompt into `state`.
    pub fn prompt(&self, state: &mut FlowLmState, token_ids: &[u32]) -> Result<()> {
        let emb = self.flow_lm.text_embeddings(token_ids)?;
        self.flow_lm.prompt_text(state, &emb)
    }

    /// Single stateful step; see `FlowLm::sample_next_latent_stateful`.
    pub fn step(
        &self,
        state: &mut FlowLmState,
        frame: &Tensor,
        opts: &GenerateOptions,
        rng: Option<&mut StdRng>,
    ) -> Result<(Tensor, bool)> {
        self.flow_lm.sample_next_latent_stateful(
            state,
            frame,
            opts.decode_steps,
            opts.eos_threshold,
            opts.temperature,
            rng,
        )
    }

    /// One-shot synthesis: prompt, autoregressive latent loop, projection
    /// and Mimi decode. Returns raw samples at `sample_rate()` Hz.
    pub fn generate(&self, token_ids: &[u32], opts: &GenerateOptions) -> Result<Vec<f32>> {
        let mut state = self.init_state();
        self.prompt(&mut state, token_ids)?;

        let latent_dim = self.flow_lm.latent_dim();
        let mut rng = opts.seed.map(StdRng::seed_from_u64);
        // The first frame is the NaN sentinel; the step replaces it with
        // the BOS embedding.
        let mut frame = Tensor::full(f32::NAN, &[1, 1, latent_dim]);
        let mut frames: Vec<Tensor> = Vec::new();
        for step in 0..opts.max_steps {
            let (next, is_eos) = self.step(&mut state, &frame, opts, rng.as_mut())?;
            frames.push(next.clone());
            frame = next;
            if is_eos {
                log::debug!("generate: eos after {} frames", step + 1);
                break;
            }
        }
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<&Tensor> = frames.iter().collect();
        let latents = Tensor::concat(&refs, 1)?;
        let projected = self.latent_to_mimi(&latents)?;
        let audio = self.mimi.decode(&projected)?;
        Ok(audio.to_vec())
    }

    /// Projects normalized latent frames `[B, T, latent]` to the Mimi
    /// input `[B, dim, T]`, through the fused GEMV when available.
    pub fn latent_to_mimi(&self, latent: &Tensor) -> Result<Tensor> {
        if let Some(projector) = &self.projector {
            return projector.project(latent);
        }
        // Unfused fallback: denormalize, then the 1x1 conv.
        let denorm = latent
            .broadcast_mul(self.flow_lm.emb_std())?
            .broadcast_add(self.flow_lm.emb_mean())?;
        self.mimi.quantizer_project(&denorm.transpose(1, 2)?)
    }

    /// Decodes projected latents to samples; see `Mimi::decode`.
    pub fn mimi_decode(&self, x: &Tensor) -> Result<Tensor> {
        self.mimi.decode(x)
    }

    /// Voice encoding is a decoder-only non-goal; this always fails with
    /// the `NotImplemented` sentinel so callers can tell it apart from a
    /// real fault.
    pub fn encode_voice(&self, _samples: &[f32]) -> Result<Tensor> {
        Err(Error::NotImplemented("voice encoder"))
    }
}

impl std::fmt::Debug for PocketTts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PocketTts")
            .field("d_model", &self.flow_lm.d_model())
            .field("layers", &self.flow_lm.num_layers())
            .field("mimi_dim", &self.mimi.dim())
            .field("fused_projector", &self.projector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_checkpoint::{tiny_checkpoint, TinyDims};

    fn tiny() -> (PocketTts, TinyDims) {
        let dims = TinyDims::default();
        let store = WeightStore::from_bytes(tiny_checkpoint(&dims, 3)).unwrap();
        let flow_config = FlowLmConfig {
            d_model: dims.d_model,
            num_heads: Some(dims.num_heads),
            latent_dim: dims.latent,
            ..FlowLmConfig::default()
        };
        let mimi_config = MimiConfig { num_heads: 2, ..MimiConfig::default() };
        let model = PocketTts::from_store(store, &flow_config, &mimi_config).unwrap();
        (model, dims)
    }

    #[test]
    fn fused_projector_matches_unfused_reference() {
        let (model, dims) = tiny();
        assert!(model.projector.is_some());
        let latent = Tensor::new(
            (0..2 * dims.latent).map(|i| (i as f32 * 0.37).sin()).collect(),
            &[1, 2, dims.latent],
        )
        .unwrap();

        let fused = model.latent_to_mimi(&latent).unwrap();
        assert_eq!(fused.shape(), &[1, dims.mimi_dim, 2]);

        let denorm = latent
            .broadcast_mul(model.flow_lm.emb_std())
            .unwrap()
            .broadcast_add(model.flow_lm.emb_mean())
            .unwrap();
        let unfused = model
            .mimi
            .quantizer_project(&denorm.transpose(1, 2).unwrap())
            .unwrap();
        for (a, b) in fused.data().iter().zip(unfused.data()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn one_shot_generation_produces_samples() {
        let (model, _) = tiny();
        let opts = GenerateOptions {
            max_steps: 3,
            decode_steps: 2,
            eos_threshold: f32::INFINITY,
            temperature: 0.5,
            seed: Some(42),
        };
        let audio = model.generate(&[1, 2, 3], &opts).unwrap();
        // 3 frames, never EOS -> 3 * 1920 samples.
        assert_eq!(audio.len(), 3 * 1920);
        assert!(audio.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn eos_stops_after_appending_the_frame() {
        let (model, _) = tiny();
        let opts = GenerateOptions {
            max_steps: 10,
            decode_steps: 1,
            eos_threshold: f32::NEG_INFINITY,
            temperature: 0.0,
            seed: None,
        };
        let audio = model.generate(&[1], &opts).unwrap();
        // EOS on the first step still yields that frame's worth of audio.
        assert_eq!(audio.len(), 1920);
    }

    #[test]
    fn voice_encoder_is_the_sentinel() {
        let (model, _) = tiny();
        let err = model.encode_voice(&[0.0; 16]).unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn generation_is_reproducible_for_a_seed() {
        let (model, _) = tiny();
        let opts = GenerateOptions {
            max_steps: 2,
            decode_steps: 1,
            eos_threshold: f32::INFINITY,
            temperature: 1.0,
            seed: Some(7),
        };
        let a = model.generate(&[2, 3], &opts).unwrap();
        let b = model.generate(&[2, 3], &opts).unwrap();
        assert_eq!(a, b);
    }
}
