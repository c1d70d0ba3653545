use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::{linear, linear_no_bias, rms_norm, Linear, Module, RmsNorm, VarBuilder};
use serde::Deserialize;

use crate::error::Result;
use crate::zimage::attention::scaled_attention;

/// Single-stream DiT configuration, read from `transformer/config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZImageTransformerConfig {
    pub in_channels: usize,
    pub patch_size: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_layers: usize,
    pub num_refiner_layers: usize,
    pub caption_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub frequency_embedding_size: usize,
}

impl Default for ZImageTransformerConfig {
    fn default() -> Self {
        Self {
            in_channels: 16,
            patch_size: 2,
            hidden_size: 3072,
            num_attention_heads: 24,
            num_layers: 30,
            num_refiner_layers: 2,
            caption_dim: 2560,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            frequency_embedding_size: 256,
        }
    }
}

/// Sinusoidal timestep embedding followed by a two-layer MLP.
#[derive(Debug, Clone)]
struct TimestepEmbedder {
    fc1: Linear,
    fc2: Linear,
    frequency_embedding_size: usize,
}

impl TimestepEmbedder {
    fn new(config: &ZImageTransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(config.frequency_embedding_size, config.hidden_size, vb.pp("fc1"))?,
            fc2: linear(config.hidden_size, config.hidden_size, vb.pp("fc2"))?,
            frequency_embedding_size: config.frequency_embedding_size,
        })
    }

    fn forward(&self, t: f64, dtype: DType, device: &candle_core::Device) -> Result<Tensor> {
        let half = self.frequency_embedding_size / 2;
        let mut values = Vec::with_capacity(self.frequency_embedding_size);
        for i in 0..half {
            let freq = (-(10_000f64.ln()) * i as f64 / half as f64).exp();
            values.push((t * freq).cos() as f32);
        }
        for i in 0..half {
            let freq = (-(10_000f64.ln()) * i as f64 / half as f64).exp();
            values.push((t * freq).sin() as f32);
        }
        let emb = Tensor::from_vec(values, (1, self.frequency_embedding_size), device)?
            .to_dtype(dtype)?;
        let emb = candle_nn::ops::silu(&self.fc1.forward(&emb)?)?;
        Ok(self.fc2.forward(&emb)?)
    }
}

/// Rotary embedding over a flat joint sequence (caption tokens first, image
/// tokens after), rebuilt per forward because sequence length varies with
/// resolution.
fn rope_tables(
    seq_len: usize,
    head_dim: usize,
    theta: f64,
    dtype: DType,
    device: &candle_core::Device,
) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let inv_freq: Vec<f32> = (0..half)
        .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
    let positions = Tensor::arange(0u32, seq_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((seq_len, 1))?;
    let freqs = positions.matmul(&inv_freq)?;
    let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
    Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
}

fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let dim = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, dim / 2)?;
    let x2 = x.narrow(D::Minus1, dim / 2, dim / 2)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    Ok((x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
}

#[derive(Debug, Clone)]
struct JointAttention {
    qkv: Linear,
    out: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    head_dim: usize,
}

impl JointAttention {
    fn new(config: &ZImageTransformerConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.hidden_size / config.num_attention_heads;
        Ok(Self {
            qkv: linear_no_bias(config.hidden_size, 3 * config.hidden_size, vb.pp("qkv"))?,
            out: linear_no_bias(config.hidden_size, config.hidden_size, vb.pp("out"))?,
            q_norm: rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: config.num_attention_heads,
            head_dim,
        })
    }

    fn forward(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, seq_len, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let q = apply_rope(&self.q_norm.forward(&q)?, cos, sin)?;
        let k = apply_rope(&self.k_norm.forward(&k)?, cos, sin)?;
        let out = scaled_attention(&q, &k, &v, None)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.out.forward(&out)?)
    }
}

#[derive(Debug, Clone)]
struct SwiGlu {
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl SwiGlu {
    fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate: linear_no_bias(dim, hidden, vb.pp("gate"))?,
            up: linear_no_bias(dim, hidden, vb.pp("up"))?,
            down: linear_no_bias(hidden, dim, vb.pp("down"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate.forward(xs)?)?;
        Ok(self.down.forward(&(gate * self.up.forward(xs)?)?)?)
    }
}

/// One transformer block. Refiner blocks over caption tokens run without
/// timestep modulation; noise refiner and joint blocks are adaLN-gated.
#[derive(Debug, Clone)]
struct Block {
    attn_norm: RmsNorm,
    attn: JointAttention,
    ffn_norm: RmsNorm,
    ffn: SwiGlu,
    modulation: Option<Linear>,
}

impl Block {
    fn new(config: &ZImageTransformerConfig, modulated: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            attn_norm: rms_norm(hidden, config.rms_norm_eps, vb.pp("attn_norm"))?,
            attn: JointAttention::new(config, vb.pp("attn"))?,
            ffn_norm: rms_norm(hidden, config.rms_norm_eps, vb.pp("ffn_norm"))?,
            ffn: SwiGlu::new(hidden, hidden * 4, vb.pp("ffn"))?,
            modulation: if modulated {
                Some(linear(hidden, 4 * hidden, vb.pp("modulation"))?)
            } else {
                None
            },
        })
    }

    fn forward(&self, xs: &Tensor, t_emb: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (scale_msa, gate_msa, scale_mlp, gate_mlp) = match &self.modulation {
            Some(modulation) => {
                let m = modulation
                    .forward(&candle_nn::ops::silu(t_emb)?)?
                    .unsqueeze(1)?;
                let chunks = m.chunk(4, D::Minus1)?;
                (
                    Some(chunks[0].clone()),
                    Some(chunks[1].clone()),
                    Some(chunks[2].clone()),
                    Some(chunks[3].clone()),
                )
            }
            None => (None, None, None, None),
        };

        let attn_in = modulate(&self.attn_norm.forward(xs)?, scale_msa.as_ref())?;
        let attn_out = gate(&self.attn.forward(&attn_in, cos, sin)?, gate_msa.as_ref())?;
        let xs = (xs + attn_out)?;

        let ffn_in = modulate(&self.ffn_norm.forward(&xs)?, scale_mlp.as_ref())?;
        let ffn_out = gate(&self.ffn.forward(&ffn_in)?, gate_mlp.as_ref())?;
        Ok((xs + ffn_out)?)
    }
}

fn modulate(xs: &Tensor, scale: Option<&Tensor>) -> Result<Tensor> {
    match scale {
        Some(scale) => Ok(xs.broadcast_mul(&(scale + 1.0)?)?),
        None => Ok(xs.clone()),
    }
}

fn gate(xs: &Tensor, gate: Option<&Tensor>) -> Result<Tensor> {
    match gate {
        Some(gate) => Ok(xs.broadcast_mul(gate)?),
        None => Ok(xs.clone()),
    }
}

/// The S3-DiT denoiser: a single token stream carrying caption and image
/// tokens through shared blocks, predicting flow-match velocity.
#[derive(Debug, Clone)]
pub struct ZImageTransformer {
    x_embedder: Linear,
    cap_norm: RmsNorm,
    cap_embedder: Linear,
    t_embedder: TimestepEmbedder,
    context_refiner: Vec<Block>,
    noise_refiner: Vec<Block>,
    layers: Vec<Block>,
    final_norm: RmsNorm,
    final_modulation: Linear,
    final_proj: Linear,
    config: ZImageTransformerConfig,
}

impl ZImageTransformer {
    pub fn new(config: &ZImageTransformerConfig, vb: VarBuilder) -> Result<Self> {
        let patch_dim = config.in_channels * config.patch_size * config.patch_size;
        let hidden = config.hidden_size;

        let mut context_refiner = Vec::with_capacity(config.num_refiner_layers);
        let mut noise_refiner = Vec::with_capacity(config.num_refiner_layers);
        for i in 0..config.num_refiner_layers {
            context_refiner.push(Block::new(config, false, vb.pp("context_refiner").pp(i))?);
            noise_refiner.push(Block::new(config, true, vb.pp("noise_refiner").pp(i))?);
        }
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(Block::new(config, true, vb.pp("layers").pp(i))?);
        }

        Ok(Self {
            x_embedder: linear(patch_dim, hidden, vb.pp("x_embedder"))?,
            cap_norm: rms_norm(config.caption_dim, config.rms_norm_eps, vb.pp("cap_norm"))?,
            cap_embedder: linear(config.caption_dim, hidden, vb.pp("cap_embedder"))?,
            t_embedder: TimestepEmbedder::new(config, vb.pp("t_embedder"))?,
            context_refiner,
            noise_refiner,
            layers,
            final_norm: rms_norm(hidden, config.rms_norm_eps, vb.pp("final_norm"))?,
            final_modulation: linear(hidden, hidden, vb.pp("final_modulation"))?,
            final_proj: linear(hidden, patch_dim, vb.pp("final_proj"))?,
            config: config.clone(),
        })
    }

    /// Predict velocity for the latents at training-domain timestep `t`.
    ///
    /// `latents`: `[batch, in_channels, h, w]`, `cap_feats`:
    /// `[batch, cap_len, caption_dim]`. Output has the latents' shape.
    pub fn forward(&self, latents: &Tensor, t: f64, cap_feats: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = latents.dims4()?;
        let p = self.config.patch_size;
        let dtype = latents.dtype();
        let device = latents.device();
        let head_dim = self.config.hidden_size / self.config.num_attention_heads;

        let img_tokens = patchify(latents, p)?;
        let img_len = img_tokens.dim(1)?;
        let mut img = self.x_embedder.forward(&img_tokens)?;

        let cap_len = cap_feats.dim(1)?;
        let mut cap = self
            .cap_embedder
            .forward(&self.cap_norm.forward(cap_feats)?)?;

        let t_emb = self.t_embedder.forward(t, dtype, device)?;

        let (cap_cos, cap_sin) = rope_tables(cap_len, head_dim, self.config.rope_theta, dtype, device)?;
        for block in &self.context_refiner {
            cap = block.forward(&cap, &t_emb, &cap_cos, &cap_sin)?;
        }

        let (joint_cos, joint_sin) =
            rope_tables(cap_len + img_len, head_dim, self.config.rope_theta, dtype, device)?;
        let (img_cos, img_sin) = (
            joint_cos.narrow(0, cap_len, img_len)?,
            joint_sin.narrow(0, cap_len, img_len)?,
        );
        for block in &self.noise_refiner {
            img = block.forward(&img, &t_emb, &img_cos, &img_sin)?;
        }

        let mut joint = Tensor::cat(&[&cap, &img], 1)?;
        for block in &self.layers {
            joint = block.forward(&joint, &t_emb, &joint_cos, &joint_sin)?;
        }

        let img = joint.narrow(1, cap_len, img_len)?;
        let scale = self
            .final_modulation
            .forward(&candle_nn::ops::silu(&t_emb)?)?
            .unsqueeze(1)?;
        let img = self
            .final_norm
            .forward(&img)?
            .broadcast_mul(&(scale + 1.0)?)?;
        let out = self.final_proj.forward(&img)?;
        unpatchify(&out, b, c, h, w, p)
    }
}

fn patchify(latents: &Tensor, p: usize) -> Result<Tensor> {
    let (b, c, h, w) = latents.dims4()?;
    Ok(latents
        .reshape((b, c, h / p, p, w / p, p))?
        .permute((0, 2, 4, 1, 3, 5))?
        .reshape((b, (h / p) * (w / p), c * p * p))?)
}

fn unpatchify(tokens: &Tensor, b: usize, c: usize, h: usize, w: usize, p: usize) -> Result<Tensor> {
    Ok(tokens
        .reshape((b, h / p, w / p, c, p, p))?
        .permute((0, 3, 1, 4, 2, 5))?
        .reshape((b, c, h, w))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_config() -> ZImageTransformerConfig {
        ZImageTransformerConfig {
            in_channels: 4,
            patch_size: 2,
            hidden_size: 32,
            num_attention_heads: 4,
            num_layers: 2,
            num_refiner_layers: 1,
            caption_dim: 16,
            rms_norm_eps: 1e-5,
            rope_theta: 10_000.0,
            frequency_embedding_size: 8,
        }
    }

    #[test]
    fn patchify_round_trips() {
        let device = Device::Cpu;
        let latents = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &device).unwrap();
        let tokens = patchify(&latents, 2).unwrap();
        assert_eq!(tokens.dims(), &[1, 16, 16]);
        let back = unpatchify(&tokens, 1, 4, 8, 8, 2).unwrap();
        let diff = (back - &latents)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn velocity_has_latent_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = ZImageTransformer::new(&tiny_config(), vb).unwrap();
        let latents = Tensor::randn(0f32, 1f32, (1, 4, 8, 8), &device).unwrap();
        let cap = Tensor::randn(0f32, 1f32, (1, 5, 16), &device).unwrap();
        let out = model.forward(&latents, 500.0, &cap).unwrap();
        assert_eq!(out.dims(), latents.dims());
    }

    #[test]
    fn config_defaults_match_turbo_checkpoint() {
        let config: ZImageTransformerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.in_channels, 16);
        assert_eq!(config.num_layers, 30);
        assert_eq!(config.patch_size, 2);
    }
}
