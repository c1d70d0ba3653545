use candle_core::{DType, Device, Tensor, D};
use candle_nn::{embedding, linear_no_bias, rms_norm, Embedding, Linear, Module, RmsNorm, VarBuilder};
use serde::Deserialize;

use crate::error::Result;
use crate::zimage::attention::scaled_attention;

/// Qwen3-family causal encoder. Z-Image conditions on the last hidden
/// states of the language model rather than a pooled embedding, so this
/// is the base model without the LM head.
#[derive(Debug, Clone, Deserialize)]
pub struct TextEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    pub head_dim: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    1_000_000.0
}

fn default_max_position_embeddings() -> usize {
    32_768
}

impl TextEncoderConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &TextEncoderConfig, dtype: DType, device: &Device) -> Result<Self> {
        let dim = config.head_dim();
        let max_len = config.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| (1.0 / config.rope_theta.powf(2.0 * i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, dim / 2), device)?;
        let positions = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            cos: emb.cos()?.to_dtype(dtype)?,
            sin: emb.sin()?.to_dtype(dtype)?,
        })
    }

    // x: [batch, heads, seq, head_dim]
    fn apply(&self, x: &Tensor, seq_len: usize) -> Result<Tensor> {
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let dim = x.dim(D::Minus1)?;
        let x1 = x.narrow(D::Minus1, 0, dim / 2)?;
        let x2 = x.narrow(D::Minus1, dim / 2, dim / 2)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        Ok((x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?)
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(config: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        Ok(Self {
            q_proj: linear_no_bias(
                config.hidden_size,
                config.num_attention_heads * head_dim,
                vb.pp("q_proj"),
            )?,
            k_proj: linear_no_bias(
                config.hidden_size,
                config.num_key_value_heads * head_dim,
                vb.pp("k_proj"),
            )?,
            v_proj: linear_no_bias(
                config.hidden_size,
                config.num_key_value_heads * head_dim,
                vb.pp("v_proj"),
            )?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            q_norm: rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        rope: &RotaryEmbedding,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;
        let split = |proj: &Linear, heads: usize| -> Result<Tensor> {
            Ok(proj
                .forward(xs)?
                .reshape((b, seq_len, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(&self.q_proj, self.num_heads)?;
        let k = split(&self.k_proj, self.num_kv_heads)?;
        let v = split(&self.v_proj, self.num_kv_heads)?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;
        let q = rope.apply(&q, seq_len)?;
        let k = rope.apply(&k, seq_len)?;
        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        let out = scaled_attention(&q, &k, &v, mask)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, kv_heads, n_rep, seq_len, head_dim))?
        .reshape((b, kv_heads * n_rep, seq_len, head_dim))?)
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn new(config: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

#[derive(Debug, Clone)]
struct Block {
    input_layernorm: RmsNorm,
    attention: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            attention: Attention::new(config, vb.pp("self_attn"))?,
            post_attention_layernorm: rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        rope: &RotaryEmbedding,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = (residual + self.attention.forward(&xs, rope, mask)?)?;
        let residual = &xs;
        let out = self.post_attention_layernorm.forward(&xs)?;
        Ok((residual + self.mlp.forward(&out)?)?)
    }
}

/// The encoder proper. One full forward per prompt; no KV cache, prompts
/// are encoded exactly once per generation.
#[derive(Debug, Clone)]
pub struct TextEncoder {
    embed_tokens: Embedding,
    blocks: Vec<Block>,
    norm: RmsNorm,
    rope: RotaryEmbedding,
    dtype: DType,
    device: Device,
}

impl TextEncoder {
    pub fn new(config: &TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb_m.pp("embed_tokens"))?;
        let vb_l = vb_m.pp("layers");
        let mut blocks = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            blocks.push(Block::new(config, vb_l.pp(i))?);
        }
        Ok(Self {
            embed_tokens,
            blocks,
            norm: rms_norm(config.hidden_size, config.rms_norm_eps, vb_m.pp("norm"))?,
            rope: RotaryEmbedding::new(config, vb.dtype(), vb.device())?,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    /// Last hidden states for the prompt tokens: `[batch, seq, hidden]`.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let mask = if seq_len > 1 {
            Some(self.causal_mask(seq_len)?)
        } else {
            None
        };
        let mut xs = self.embed_tokens.forward(input_ids)?;
        for block in &self.blocks {
            xs = block.forward(&xs, &self.rope, mask.as_ref())?;
        }
        Ok(self.norm.forward(&xs)?)
    }

    fn causal_mask(&self, seq_len: usize) -> Result<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        Ok(Tensor::from_vec(mask, (seq_len, seq_len), &self.device)?.to_dtype(self.dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> TextEncoderConfig {
        TextEncoderConfig {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            head_dim: None,
            max_position_embeddings: 64,
        }
    }

    #[test]
    fn forward_shape_and_determinism() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = TextEncoder::new(&tiny_config(), vb).unwrap();
        let ids = Tensor::zeros((1, 6), DType::U32, &device).unwrap();
        let a = encoder.forward(&ids).unwrap();
        assert_eq!(a.dims(), &[1, 6, 16]);
        let b = encoder.forward(&ids).unwrap();
        let diff = (a - b)
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
    fn config_parses_from_model_json() {
        let raw = r#"{
            "vocab_size": 151936,
            "hidden_size": 2560,
            "intermediate_size": 9728,
            "num_hidden_layers": 36,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "head_dim": 128,
            "rope_theta": 1000000.0
        }"#;
        let config: TextEncoderConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.num_hidden_layers, 36);
    }
}
