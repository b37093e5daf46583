//! FlowLM: the autoregressive transformer that emits one 32-dim latent
//! frame per step, with a flow-matching decoder producing each frame
//! from Gaussian noise conditioned on the last hidden state.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Context, Error, Result};
use crate::modules::activations::{gelu_erf_in_place, replace_nan_with_vector};
use crate::modules::attention::{KvCache, SelfAttention};
use crate::modules::flownet::FlowNet;
use crate::modules::rotary::{RotaryEmbedding, MAX_SEQ_LEN};
use crate::tensor::Tensor;
use crate::weights::VarBuilder;

const LN_EPS: f32 = 1e-5;
/// Seed of the deterministic default noise stream, used when the caller
/// passes no RNG.
const DEFAULT_NOISE_SEED: u64 = 42;

#[derive(Debug, Clone)]
pub struct FlowLmConfig {
    pub d_model: usize,
    /// Resolved to `d_model / 64` when unset.
    pub num_heads: Option<usize>,
    pub max_period: f32,
    pub latent_dim: usize,
}

impl Default for FlowLmConfig {
    fn default() -> Self {
        Self { d_model: 1024, num_heads: None, max_period: 10000.0, latent_dim: 32 }
    }
}

/// Gaussian noise `~ N(0, sqrt(max(temperature, 0)))` of shape
/// `[batch, dim]`. Without an RNG the stream is seeded per call, so the
/// default is deterministic; negative temperatures clamp to silence.
pub fn make_gaussian_noise(batch: usize, dim: usize, temperature: f32, rng: Option<&mut StdRng>) -> Tensor {
    let std = temperature.max(0.0).sqrt();
    if std == 0.0 {
        return Tensor::zeros(&[batch, dim]);
    }
    let mut default_rng;
    let rng = match rng {
        Some(r) => r,
        None => {
            default_rng = StdRng::seed_from_u64(DEFAULT_NOISE_SEED);
            &mut default_rng
        }
    };
    let data: Vec<f32> = (0..batch * dim)
        .map(|_| {
            let z: f32 = StandardNormal.sample(rng);
            z * std
        })
        .collect();
    Tensor::new(data, &[batch, dim]).expect("noise shape")
}

/// Pre-norm transformer layer with fused-QKV attention and a GELU MLP.
#[derive(Debug)]
struct TransformerLayer {
    norm1_weight: Tensor,
    norm1_bias: Tensor,
    norm2_weight: Tensor,
    norm2_bias: Tensor,
    attn: SelfAttention,
    linear1: Tensor,
    linear2: Tensor,
}

impl TransformerLayer {
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
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        cache: Option<&mut KvCache>,
        pos: usize,
        causal: bool,
    ) -> Result<Tensor> {
        let h = x.layer_norm(Some(&self.norm1_weight), Some(&self.norm1_bias), LN_EPS)?;
        let h = self.attn.forward(&h, Some(rope), cache, pos, causal)?;
        let x = x.broadcast_add(&h)?;

        let h = x.layer_norm(Some(&self.norm2_weight), Some(&self.norm2_bias), LN_EPS)?;
        let mut h = h.linear(&self.linear1, None)?;
        gelu_erf_in_place(&mut h);
        let h = h.linear(&self.linear2, None)?;
        x.broadcast_add(&h)
    }
}

/// Per-request generation state: one cache entry per transformer layer.
/// Owned by a single request; not thread-safe.
#[derive(Debug, Default)]
pub struct FlowLmState {
    layers: Vec<KvCache>,
}

impl FlowLmState {
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|c| c.seq_len()).unwrap_or(0)
    }

    /// Cached sequence length of every layer; the invariant keeps them
    /// identical.
    pub fn layer_seq_lens(&self) -> Vec<usize> {
        self.layers.iter().map(|c| c.seq_len()).collect()
    }
}

#[derive(Debug)]
pub struct FlowLm {
    d_model: usize,
    num_heads: usize,
    latent_dim: usize,
    embed: Tensor,
    layers: Vec<TransformerLayer>,
    out_norm_weight: Tensor,
    out_norm_bias: Tensor,
    out_eos_weight: Tensor,
    out_eos_bias: Tensor,
    input_linear_weight: Tensor,
    input_linear_bias: Tensor,
    bos_emb: Tensor,
    emb_mean: Tensor,
    emb_std: Tensor,
    flow_net: FlowNet,
    rope: RotaryEmbedding,
}

impl FlowLm {
    /// Loads the `flow_lm.*` subtree. Transformer layers are scanned
    /// from 0 until the first missing `norm1.weight`.
    pub fn load(config: &FlowLmConfig, vb: &VarBuilder) -> Result<Self> {
        let embed = vb.pp("conditioner").pp("embed").get_any("weight").context("flow_lm: conditioner")?;
        let d_model = config.d_model;
        if embed.rank() != 2 || embed.shape()[1] != d_model {
            return Err(Error::ShapeMismatch {
                op: "flow_lm",
                expected: vec![embed.shape()[0], d_model],
                got: embed.shape().to_vec(),
            });
        }
        let num_heads = config.num_heads.unwrap_or(d_model / 64);
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(Error::invalid(
                "flow_lm",
                format!("d_model {d_model} not divisible by {num_heads} heads"),
            ));
        }

        let mut layers = Vec::new();
        loop {
            let idx = layers.len();
            let layer_vb = vb.pp("transformer").pp("layers").pp(idx.to_string());
            if !layer_vb.pp("norm1").contains("weight") {
                break;
            }
            let layer = TransformerLayer::load(&layer_vb, num_heads)
                .with_context(|| format!("flow_lm: transformer layer {idx}"))?;
            layers.push(layer);
        }
        if layers.is_empty() {
            return Err(Error::TensorNotFound(vb.full_name("transformer.layers.0.norm1.weight")));
        }

        let latent_dim = config.latent_dim;
        let bos_emb = vb.get(&[latent_dim], "bos_emb")?;
        let emb_mean = vb.get(&[latent_dim], "emb_mean")?;
        let emb_std = vb.get(&[latent_dim], "emb_std")?;

        let rope = RotaryEmbedding::new(d_model / num_heads, MAX_SEQ_LEN, config.max_period)?;
        let flow_net = FlowNet::load(&vb.pp("flow_net")).context("flow_lm: flow_net")?;

        log::debug!(
            "flow_lm: {} layers, d_model {d_model}, {num_heads} heads, vocab {}",
            layers.len(),
            embed.shape()[0]
        );
        Ok(Self {
            d_model,
            num_heads,
            latent_dim,
            embed,
            layers,
            out_norm_weight: vb.pp("out_norm").get_any("weight")?,
            out_norm_bias: vb.pp("out_norm").get_any("bias")?,
            out_eos_weight: vb.pp("out_eos").get_any("weight")?,
            out_eos_bias: vb.pp("out_eos").get_any("bias")?,
            input_linear_weight: vb.pp("input_linear").get_any("weight")?,
            input_linear_bias: vb.pp("input_linear").get_any("bias")?,
            bos_emb,
            emb_mean,
            emb_std,
            flow_net,
            rope,
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn vocab_size(&self) -> usize {
        self.embed.shape()[0]
    }

    pub fn bos_emb(&self) -> &Tensor {
        &self.bos_emb
    }

    pub fn emb_mean(&self) -> &Tensor {
        &self.emb_mean
    }

    pub fn emb_std(&self) -> &Tensor {
        &self.emb_std
    }

    /// Looks up embedding rows for `token_ids`; an empty slice yields
    /// `[1, 0, d_model]` by contract.
    pub fn text_embeddings(&self, token_ids: &[u32]) -> Result<Tensor> {
        if token_ids.is_empty() {
            return Ok(Tensor::zeros(&[1, 0, self.d_model]));
        }
        let indices: Vec<usize> = token_ids.iter().map(|&t| t as usize).collect();
        let rows = self.embed.gather(0, &indices).context("flow_lm: text_embeddings")?;
        rows.reshape(&[1, token_ids.len(), self.d_model])
    }

    /// Fresh state with one empty cache entry per layer.
    pub fn init_state(&self) -> FlowLmState {
        FlowLmState { layers: (0..self.layers.len()).map(|_| KvCache::new()).collect() }
    }

    fn transformer_pass(&self, state: &mut FlowLmState, x: &Tensor, causal: bool) -> Result<Tensor> {
        let pos = state.seq_len();
        let mut h = x.clone();
        for (layer, cache) in self.layers.iter().zip(state.layers.iter_mut()) {
            h = layer.forward(&h, &self.rope, Some(cache), pos, causal)?;
        }
        Ok(h)
    }

    /// Prefills the cache with a text prompt, causal over the window.
    /// An empty `T = 0` prompt is a no-op.
    pub fn prompt_text(&self, state: &mut FlowLmState, text_emb: &Tensor) -> Result<()> {
        if text_emb.rank() != 3 {
            return Err(Error::RankMismatch { op: "prompt_text", expected: 3, got: text_emb.rank() });
        }
        if text_emb.dim(-1)? != self.d_model {
            return Err(Error::ShapeMismatch {
                op: "prompt_text",
                expected: vec![self.d_model],
                got: vec![text_emb.dim(-1)?],
            });
        }
        if text_emb.dim(1)? == 0 {
            return Ok(());
        }
        self.transformer_pass(state, text_emb, true).context("flow_lm: prompt")?;
        Ok(())
    }

    /// One generation step: replaces NaN sentinel entries with the BOS
    /// vector, projects the frame, runs a single-token transformer step
    /// against the cache, decides EOS, and flow-decodes the next frame
    /// from noise. Returns `([B, 1, latent], is_eos)`.
    pub fn sample_next_latent_stateful(
        &self,
        state: &mut FlowLmState,
        sequence_frame: &Tensor,
        decode_steps: usize,
        eos_threshold: f32,
        temperature: f32,
        rng: Option<&mut StdRng>,
    ) -> Result<(Tensor, bool)> {
        if sequence_frame.rank() != 3 || sequence_frame.dim(-1)? != self.latent_dim {
            return Err(Error::ShapeMismatch {
                op: "sample_next_latent",
                expected: vec![1, 1, self.latent_dim],
                got: sequence_frame.shape().to_vec(),
            });
        }
        let batch = sequence_frame.dim(0)?;
        let mut frame = sequence_frame.clone();
        replace_nan_with_vector(&mut frame, self.bos_emb.data())?;

        let x = frame.linear(&self.input_linear_weight, Some(&self.input_linear_bias))?;
        let h = self.transformer_pass(state, &x, false).context("flow_lm: step")?;
        let h = h.layer_norm(Some(&self.out_norm_weight), Some(&self.out_norm_bias), LN_EPS)?;

        let t = h.dim(1)?;
        let last = h.narrow(1, t - 1, 1)?.reshape(&[batch, self.d_model])?;
        let eos_logit = last.linear(&self.out_eos_weight, Some(&self.out_eos_bias))?;
        let is_eos = eos_logit.data()[0] > eos_threshold;

        let noise = make_gaussian_noise(batch, self.latent_dim, temperature, rng);
        let latent = self
            .flow_net
            .lsd_decode(&last, &noise, decode_steps)
            .context("flow_lm: lsd_decode")?;
        Ok((latent.reshape(&[batch, 1, self.latent_dim])?, is_eos))
    }

    /// Non-stateful forward: concatenates the text embedding with the
    /// input-projected latent sequence, runs the transformer causally
    /// over the whole window, and returns the last hidden state and the
    /// EOS logit.
    pub fn flow_main(&self, text_emb: &Tensor, sequence: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch = text_emb.dim(0)?;
        let mut seq = sequence.clone();
        replace_nan_with_vector(&mut seq, self.bos_emb.data())?;
        let projected = seq.linear(&self.input_linear_weight, Some(&self.input_linear_bias))?;
        let x = Tensor::concat(&[text_emb, &projected], 1)?;

        let mut state = self.init_state();
        let h = self.transformer_pass(&mut state, &x, true).context("flow_lm: flow_main")?;
        let h = h.layer_norm(Some(&self.out_norm_weight), Some(&self.out_norm_bias), LN_EPS)?;
        let t = h.dim(1)?;
        let last = h.narrow(1, t - 1, 1)?.reshape(&[batch, self.d_model])?;
        let eos_logit = last.linear(&self.out_eos_weight, Some(&self.out_eos_bias))?;
        Ok((last, eos_logit))
    }

    /// Flow direction of the LSD decoder at `(s, t)`.
    pub fn flow_direction(&self, c: &Tensor, s: &Tensor, t: &Tensor, x: &Tensor) -> Result<Tensor> {
        self.flow_net.forward(c, s, t, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_checkpoint::{tiny_checkpoint, TinyDims};
    use crate::weights::{VarBuilder, WeightStore};

    fn tiny() -> (FlowLm, TinyDims) {
        let dims = TinyDims::default();
        let store = WeightStore::from_bytes(tiny_checkpoint(&dims, 7)).unwrap();
        let config = FlowLmConfig {
            d_model: dims.d_model,
            num_heads: Some(dims.num_heads),
            latent_dim: dims.latent,
            ..FlowLmConfig::default()
        };
        let model = FlowLm::load(&config, &VarBuilder::new(store).pp("flow_lm")).unwrap();
        (model, dims)
    }

    #[test]
    fn loads_and_scans_layers() {
        let (model, dims) = tiny();
        assert_eq!(model.num_layers(), dims.num_layers);
        assert_eq!(model.vocab_size(), dims.vocab);
        assert_eq!(model.latent_dim(), dims.latent);
    }

    #[test]
    fn text_embeddings_shape_and_determinism() {
        let (model, dims) = tiny();
        let e1 = model.text_embeddings(&[1, 2, 3]).unwrap();
        assert_eq!(e1.shape(), &[1, 3, dims.d_model]);
        let e2 = model.text_embeddings(&[1, 2, 3]).unwrap();
        assert_eq!(e1.data(), e2.data());

        let empty = model.text_embeddings(&[]).unwrap();
        assert_eq!(empty.shape(), &[1, 0, dims.d_model]);

        assert!(model.text_embeddings(&[dims.vocab as u32]).is_err());
    }

    #[test]
    fn prefill_populates_every_layer_cache() {
        let (model, _) = tiny();
        let emb = model.text_embeddings(&[1, 2, 3, 4, 5]).unwrap();
        let mut state = model.init_state();
        model.prompt_text(&mut state, &emb).unwrap();
        assert_eq!(state.seq_len(), 5);
        for cache in &state.layers {
            assert_eq!(cache.seq_len(), 5);
        }
        // Empty prompt is a no-op.
        let empty = model.text_embeddings(&[]).unwrap();
        model.prompt_text(&mut state, &empty).unwrap();
        assert_eq!(state.seq_len(), 5);
    }

    #[test]
    fn nan_sentinel_step_produces_finite_latent() {
        let (model, dims) = tiny();
        let mut state = model.init_state();
        let emb = model.text_embeddings(&[1, 2]).unwrap();
        model.prompt_text(&mut state, &emb).unwrap();

        let frame = Tensor::full(f32::NAN, &[1, 1, dims.latent]);
        let (next, _) = model
            .sample_next_latent_stateful(&mut state, &frame, 4, 0.5, 1.0, None)
            .unwrap();
        assert_eq!(next.shape(), &[1, 1, dims.latent]);
        assert!(next.data().iter().all(|v| v.is_finite()));
        assert_eq!(state.seq_len(), 3);
    }

    #[test]
    fn eos_thresholds_bracket_the_logit() {
        let (model, dims) = tiny();
        let frame = Tensor::zeros(&[1, 1, dims.latent]);

        let mut state = model.init_state();
        let (_, eos) = model
            .sample_next_latent_stateful(&mut state, &frame, 1, f32::NEG_INFINITY, 0.0, None)
            .unwrap();
        assert!(eos);

        let mut state = model.init_state();
        let (_, eos) = model
            .sample_next_latent_stateful(&mut state, &frame, 1, f32::INFINITY, 0.0, None)
            .unwrap();
        assert!(!eos);
    }

    #[test]
    fn default_noise_stream_is_deterministic() {
        let a = make_gaussian_noise(2, 8, 1.0, None);
        let b = make_gaussian_noise(2, 8, 1.0, None);
        assert_eq!(a.data(), b.data());
        assert!(a.data().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn negative_temperature_clamps_to_silence() {
        let n = make_gaussian_noise(1, 16, -3.0, None);
        assert!(n.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn flow_main_matches_stateful_last_hidden() {
        let (model, dims) = tiny();
        let emb = model.text_embeddings(&[3, 4, 5]).unwrap();
        let frame = Tensor::full(f32::NAN, &[1, 1, dims.latent]);

        let (last, eos_logit) = model.flow_main(&emb, &frame).unwrap();
        assert_eq!(last.shape(), &[1, dims.d_model]);
        assert_eq!(eos_logit.shape(), &[1, 1]);

        // Stateful: prefill the text, then step the same frame.
        let mut state = model.init_state();
        model.prompt_text(&mut state, &emb).unwrap();
        let x = {
            let mut f = frame.clone();
            replace_nan_with_vector(&mut f, model.bos_emb.data()).unwrap();
            f.linear(&model.input_linear_weight, Some(&model.input_linear_bias)).unwrap()
        };
        let h = model.transformer_pass(&mut state, &x, false).unwrap();
        let h = h
            .layer_norm(Some(&model.out_norm_weight), Some(&model.out_norm_bias), LN_EPS)
            .unwrap();
        let want = h.narrow(1, 0, 1).unwrap().reshape(&[1, dims.d_model]).unwrap();
        for (a, b) in last.data().iter().zip(want.data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
