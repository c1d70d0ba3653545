use std::str::FromStr;
use std::sync::{Once, RwLock};

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use tracing::warn;

use crate::error::{GeneratorError, Result};

/// Selectable attention kernel for the Z-Image transformer.
///
/// This is an instance-wide switch configured at load time, not a per-call
/// parameter. Flash variants require the `flash-attn` build feature and a
/// CUDA device; otherwise they degrade to the scaled-dot-product path with
/// a one-time warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionBackend {
    NativeFlash,
    FlashV3,
    Sdpa,
    GenericFlash,
}

impl AttentionBackend {
    pub const ACCEPTED: &'static [&'static str] =
        &["native-flash", "flash-v3", "sdpa", "generic-flash"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NativeFlash => "native-flash",
            Self::FlashV3 => "flash-v3",
            Self::Sdpa => "sdpa",
            Self::GenericFlash => "generic-flash",
        }
    }

    fn wants_flash(&self) -> bool {
        !matches!(self, Self::Sdpa)
    }
}

impl FromStr for AttentionBackend {
    type Err = GeneratorError;

    fn from_str(s: &str) -> Result<Self> {
        // Accept both the dashed names and the upstream underscore aliases.
        match s.trim().trim_start_matches('_').replace('_', "-").as_str() {
            "native-flash" | "flash" => Ok(Self::NativeFlash),
            "flash-v3" | "flash-3" => Ok(Self::FlashV3),
            "sdpa" | "scaled-dot-product" => Ok(Self::Sdpa),
            "generic-flash" => Ok(Self::GenericFlash),
            other => Err(GeneratorError::Config(format!(
                "unknown attention backend {other:?}, expected one of {:?}",
                Self::ACCEPTED
            ))),
        }
    }
}

static BACKEND: RwLock<AttentionBackend> = RwLock::new(AttentionBackend::Sdpa);
static FLASH_FALLBACK_WARNING: Once = Once::new();

/// Set the process-wide attention backend. Called once during model load.
pub fn set_attention_backend(backend: AttentionBackend) {
    *BACKEND.write().expect("attention backend lock poisoned") = backend;
}

pub fn attention_backend() -> AttentionBackend {
    *BACKEND.read().expect("attention backend lock poisoned")
}

/// Scaled dot-product attention over `[batch, heads, seq, head_dim]` inputs,
/// dispatched through the configured backend.
pub fn scaled_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let backend = attention_backend();
    if backend.wants_flash() {
        if let Some(out) = flash_attention(q, k, v, mask)? {
            return Ok(out);
        }
        FLASH_FALLBACK_WARNING.call_once(|| {
            warn!(
                backend = backend.as_str(),
                "flash attention unavailable on this build/device, using sdpa"
            );
        });
    }
    sdpa_attention(q, k, v, mask)
}

fn sdpa_attention(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let (_b, _h, _s, head_dim) = q.dims4()?;
    let dtype = q.dtype();
    let scale = 1.0 / (head_dim as f64).sqrt();

    let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };
    // Softmax in f32 for numerical stability at reduced precision.
    let weights = softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
    Ok(weights.matmul(&v.contiguous()?)?)
}

#[cfg(feature = "flash-attn")]
fn flash_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Option<Tensor>> {
    use candle_core::Device;

    // The fused kernel has no arbitrary-mask support and only runs on CUDA
    // at reduced precision.
    let cuda = matches!(q.device(), Device::Cuda(_));
    let half = matches!(q.dtype(), DType::F16 | DType::BF16);
    if !cuda || !half || mask.is_some() {
        return Ok(None);
    }
    let (_b, _h, _s, head_dim) = q.dims4()?;
    let softmax_scale = 1.0 / (head_dim as f32).sqrt();
    // flash_attn expects [batch, seq, heads, head_dim].
    let q = q.transpose(1, 2)?.contiguous()?;
    let k = k.transpose(1, 2)?.contiguous()?;
    let v = v.transpose(1, 2)?.contiguous()?;
    let out = candle_flash_attn::flash_attn(&q, &k, &v, softmax_scale, false)?;
    Ok(Some(out.transpose(1, 2)?.contiguous()?))
}

#[cfg(not(feature = "flash-attn"))]
fn flash_attention(
    _q: &Tensor,
    _k: &Tensor,
    _v: &Tensor,
    _mask: Option<&Tensor>,
) -> Result<Option<Tensor>> {
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accepted_names_and_aliases() {
        assert_eq!(
            "native-flash".parse::<AttentionBackend>().unwrap(),
            AttentionBackend::NativeFlash
        );
        assert_eq!(
            "_native_flash".parse::<AttentionBackend>().unwrap(),
            AttentionBackend::NativeFlash
        );
        assert_eq!(
            "_flash_3".parse::<AttentionBackend>().unwrap(),
            AttentionBackend::FlashV3
        );
        assert_eq!(
            "scaled-dot-product".parse::<AttentionBackend>().unwrap(),
            AttentionBackend::Sdpa
        );
        assert_eq!(
            "generic-flash".parse::<AttentionBackend>().unwrap(),
            AttentionBackend::GenericFlash
        );
    }

    #[test]
    fn rejects_unknown_backend_with_accepted_set() {
        let err = "bogus".parse::<AttentionBackend>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("sdpa"));
    }

    #[test]
    fn sdpa_matches_identity_value_passthrough() {
        // With a single key, attention weights are 1.0 and the output is v.
        let device = candle_core::Device::Cpu;
        let q = Tensor::randn(0f32, 1f32, (1, 2, 1, 4), &device).unwrap();
        let k = q.clone();
        let v = Tensor::randn(0f32, 1f32, (1, 2, 1, 4), &device).unwrap();
        let out = sdpa_attention(&q, &k, &v, None).unwrap();
        let diff = (out - &v)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
