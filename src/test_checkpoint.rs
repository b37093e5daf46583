//! Synthetic checkpoints for unit tests: a miniature FlowLM + Mimi
//! weight set with the real tensor name schema, serialized through the
//! safetensors container.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) struct CheckpointBuilder {
    entries: Vec<(String, Vec<usize>, Vec<f32>)>,
    rng: StdRng,
}

impl CheckpointBuilder {
    pub(crate) fn new(seed: u64) -> Self {
        Self { entries: Vec::new(), rng: StdRng::seed_from_u64(seed) }
    }

    pub(crate) fn add_random(&mut self, name: &str, shape: &[usize]) -> &mut Self {
        let n: usize = shape.iter().product();
        let scale = 0.5 / (shape.last().copied().unwrap_or(1) as f32).sqrt();
        let values: Vec<f32> = (0..n).map(|_| (self.rng.gen::<f32>() - 0.5) * 2.0 * scale).collect();
        self.entries.push((name.to_string(), shape.to_vec(), values));
        self
    }

    pub(crate) fn add(&mut self, name: &str, shape: &[usize], values: Vec<f32>) -> &mut Self {
        self.entries.push((name.to_string(), shape.to_vec(), values));
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut header = String::from("{");
        let mut data = Vec::new();
        for (i, (name, shape, values)) in self.entries.iter().enumerate() {
            let start = data.len();
            for v in values {
                data.extend_from_slice(&v.to_le_bytes());
            }
            let end = data.len();
            if i > 0 {
                header.push(',');
            }
            let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
            header.push_str(&format!(
                "\"{name}\":{{\"dtype\":\"F32\",\"shape\":[{}],\"data_offsets\":[{start},{end}]}}",
                dims.join(",")
            ));
        }
        header.push('}');
        let mut blob = Vec::with_capacity(8 + header.len() + data.len());
        blob.extend_from_slice(&(header.len() as u64).to_le_bytes());
        blob.extend_from_slice(header.as_bytes());
        blob.extend_from_slice(&data);
        blob
    }
}

pub(crate) struct TinyDims {
    pub d_model: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub vocab: usize,
    pub latent: usize,
    pub flow_hidden: usize,
    pub flow_freqs: usize,
    pub flow_blocks: usize,
    pub mimi_dim: usize,
    pub mimi_layers: usize,
}

impl Default for TinyDims {
    fn default() -> Self {
        Self {
            d_model: 16,
            num_heads: 2,
            num_layers: 2,
            vocab: 11,
            latent: 4,
            flow_hidden: 8,
            flow_freqs: 3,
            flow_blocks: 2,
            mimi_dim: 16,
            mimi_layers: 1,
        }
    }
}

pub(crate) fn add_flow_lm(b: &mut CheckpointBuilder, d: &TinyDims) {
    let dm = d.d_model;
    b.add_random("flow_lm.conditioner.embed.weight", &[d.vocab, dm]);
    for i in 0..d.num_layers {
        let p = format!("flow_lm.transformer.layers.{i}");
        b.add_random(&format!("{p}.norm1.weight"), &[dm]);
        b.add_random(&format!("{p}.norm1.bias"), &[dm]);
        b.add_random(&format!("{p}.norm2.weight"), &[dm]);
        b.add_random(&format!("{p}.norm2.bias"), &[dm]);
        b.add_random(&format!("{p}.self_attn.in_proj.weight"), &[3 * dm, dm]);
        b.add_random(&format!("{p}.self_attn.out_proj.weight"), &[dm, dm]);
        b.add_random(&format!("{p}.linear1.weight"), &[4 * dm, dm]);
        b.add_random(&format!("{p}.linear2.weight"), &[dm, 4 * dm]);
    }
    b.add_random("flow_lm.bos_emb", &[d.latent]);
    b.add_random("flow_lm.emb_mean", &[d.latent]);
    b.add("flow_lm.emb_std", &[d.latent], vec![1.5; d.latent]);
    b.add_random("flow_lm.input_linear.weight", &[dm, d.latent]);
    b.add_random("flow_lm.input_linear.bias", &[dm]);
    b.add_random("flow_lm.out_norm.weight", &[dm]);
    b.add_random("flow_lm.out_norm.bias", &[dm]);
    b.add_random("flow_lm.out_eos.weight", &[1, dm]);
    b.add_random("flow_lm.out_eos.bias", &[1]);

    let fh = d.flow_hidden;
    for te in 0..2 {
        let p = format!("flow_lm.flow_net.time_embed.{te}");
        b.add_random(&format!("{p}.freqs"), &[d.flow_freqs]);
        b.add_random(&format!("{p}.mlp.0.weight"), &[fh, 2 * d.flow_freqs]);
        b.add_random(&format!("{p}.mlp.0.bias"), &[fh]);
        b.add_random(&format!("{p}.mlp.2.weight"), &[fh, fh]);
        b.add_random(&format!("{p}.mlp.2.bias"), &[fh]);
        b.add_random(&format!("{p}.mlp.3.alpha"), &[fh]);
    }
    b.add_random("flow_lm.flow_net.cond_embed.weight", &[fh, dm]);
    b.add_random("flow_lm.flow_net.cond_embed.bias", &[fh]);
    b.add_random("flow_lm.flow_net.input_proj.weight", &[fh, d.latent]);
    b.add_random("flow_lm.flow_net.input_proj.bias", &[fh]);
    for i in 0..d.flow_blocks {
        let p = format!("flow_lm.flow_net.res_blocks.{i}");
        b.add_random(&format!("{p}.in_ln.weight"), &[fh]);
        b.add_random(&format!("{p}.in_ln.bias"), &[fh]);
        b.add_random(&format!("{p}.mlp.0.weight"), &[fh, fh]);
        b.add_random(&format!("{p}.mlp.0.bias"), &[fh]);
        b.add_random(&format!("{p}.mlp.2.weight"), &[fh, fh]);
        b.add_random(&format!("{p}.mlp.2.bias"), &[fh]);
        b.add_random(&format!("{p}.adaLN_modulation.1.weight"), &[3 * fh, fh]);
        b.add_random(&format!("{p}.adaLN_modulation.1.bias"), &[3 * fh]);
    }
    b.add_random("flow_lm.flow_net.final_layer.linear.weight", &[d.latent, fh]);
    b.add_random("flow_lm.flow_net.final_layer.linear.bias", &[d.latent]);
    b.add_random("flow_lm.flow_net.final_layer.adaLN_modulation.1.weight", &[2 * fh, fh]);
    b.add_random("flow_lm.flow_net.final_layer.adaLN_modulation.1.bias", &[2 * fh]);
}

pub(crate) fn add_mimi(b: &mut CheckpointBuilder, d: &TinyDims) {
    let md = d.mimi_dim;
    b.add_random("mimi.quantizer.output_proj.weight", &[md, d.latent, 1]);
    b.add_random("mimi.upsample.convtr.convtr.weight", &[md, 1, 32]);
    for i in 0..d.mimi_layers {
        let p = format!("mimi.decoder_transformer.transformer.layers.{i}");
        b.add_random(&format!("{p}.norm1.weight"), &[md]);
        b.add_random(&format!("{p}.norm1.bias"), &[md]);
        b.add_random(&format!("{p}.norm2.weight"), &[md]);
        b.add_random(&format!("{p}.norm2.bias"), &[md]);
        b.add_random(&format!("{p}.self_attn.in_proj.weight"), &[3 * md, md]);
        b.add_random(&format!("{p}.self_attn.out_proj.weight"), &[md, md]);
        b.add_random(&format!("{p}.linear1.weight"), &[4 * md, md]);
        b.add_random(&format!("{p}.linear2.weight"), &[md, 4 * md]);
        b.add_random(&format!("{p}.layer_scale_1.scale"), &[md]);
        b.add_random(&format!("{p}.layer_scale_2.scale"), &[md]);
    }
    let half = md / 2;
    let quarter = md / 4;
    let eighth = md / 8;
    b.add_random("mimi.decoder.model.0.conv.weight", &[md, md, 7]);
    b.add_random("mimi.decoder.model.0.conv.bias", &[md]);
    b.add_random("mimi.decoder.model.2.convtr.weight", &[md, half, 12]);
    b.add_random("mimi.decoder.model.2.convtr.bias", &[half]);
    b.add_random("mimi.decoder.model.3.block.1.conv.weight", &[quarter, half, 3]);
    b.add_random("mimi.decoder.model.3.block.1.conv.bias", &[quarter]);
    b.add_random("mimi.decoder.model.3.block.3.conv.weight", &[half, quarter, 1]);
    b.add_random("mimi.decoder.model.3.block.3.conv.bias", &[half]);
    b.add_random("mimi.decoder.model.5.convtr.weight", &[half, quarter, 10]);
    b.add_random("mimi.decoder.model.5.convtr.bias", &[quarter]);
    b.add_random("mimi.decoder.model.6.block.1.conv.weight", &[eighth, quarter, 3]);
    b.add_random("mimi.decoder.model.6.block.1.conv.bias", &[eighth]);
    b.add_random("mimi.decoder.model.6.block.3.conv.weight", &[quarter, eighth, 1]);
    b.add_random("mimi.decoder.model.6.block.3.conv.bias", &[quarter]);
    b.add_random("mimi.decoder.model.8.convtr.weight", &[quarter, eighth, 8]);
    b.add_random("mimi.decoder.model.8.convtr.bias", &[eighth]);
    let b9h = (eighth / 2).max(1);
    b.add_random("mimi.decoder.model.9.block.1.conv.weight", &[b9h, eighth, 3]);
    b.add_random("mimi.decoder.model.9.block.1.conv.bias", &[b9h]);
    b.add_random("mimi.decoder.model.9.block.3.conv.weight", &[eighth, b9h, 1]);
    b.add_random("mimi.decoder.model.9.block.3.conv.bias", &[eighth]);
    b.add_random("mimi.decoder.model.11.conv.weight", &[1, eighth, 3]);
    b.add_random("mimi.decoder.model.11.conv.bias", &[1]);
}

/// A full miniature checkpoint image with both subtrees.
pub(crate) fn tiny_checkpoint(dims: &TinyDims, seed: u64) -> Vec<u8> {
    let mut b = CheckpointBuilder::new(seed);
    add_flow_lm(&mut b, dims);
    add_mimi(&mut b, dims);
    b.build()
}
