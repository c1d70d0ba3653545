use std::path::PathBuf;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One text-to-image request. Optional fields fall back to configuration
/// defaults inside each adapter; backend-specific knobs live in `overrides`
/// as a typed structure rather than an open-ended pass-through.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub num_inference_steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<BackendOverrides>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Resolve the seed: caller-supplied, or drawn from `[0, 2^32)` so the
    /// result always reports a concrete reproducible value.
    pub fn resolve_seed(&self) -> u64 {
        self.seed
            .unwrap_or_else(|| rand::thread_rng().gen::<u32>() as u64)
    }

    /// Typed overrides for one backend, ignored with a warning elsewhere.
    pub fn flux_overrides(&self) -> Option<&FluxOverrides> {
        match &self.overrides {
            Some(BackendOverrides::Flux(o)) => Some(o),
            _ => None,
        }
    }
}

/// Backend-specific request options, validated at the boundary.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendOverrides {
    Flux(FluxOverrides),
    ZImage(ZImageOverrides),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FluxOverrides {
    /// Token budget for the T5 encoder; capped at the model maximum.
    pub max_sequence_length: Option<usize>,
}

/// Z-Image Turbo exposes no per-call knobs beyond the common set; the
/// attention backend and compile flag are load-time configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ZImageOverrides {}

/// Immutable description of one completed generation. Every field is fully
/// resolved before construction; no sentinel defaults.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub image_path: PathBuf,
    pub prompt: String,
    pub model: String,
    pub seed: u64,
    pub steps: usize,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Capability contract implemented by every generation backend.
///
/// Lifecycle: construct cheap, `load_model` once (idempotent), `generate` per
/// request, `cleanup` to return to unloaded. `generate` lazy-loads when
/// needed and must never run its sampling on the caller's event loop thread.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Backend identifier reported in results: "flux", "zimage", "mock".
    fn id(&self) -> &'static str;

    /// Load heavy accelerator-resident state. Safe to call repeatedly;
    /// a second call without an intervening `cleanup` is a no-op.
    async fn load_model(&self) -> Result<()>;

    /// Generate one image. Lazy-loads, resolves defaults and seed, delegates
    /// sampling to a blocking worker, and persists the image plus prompt
    /// sidecar before returning.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult>;

    /// Drop loaded weights and reclaim accelerator memory. No-op when
    /// already unloaded; a subsequent `generate` reloads.
    fn cleanup(&self);

    /// Whether heavy state is currently resident.
    fn is_loaded(&self) -> bool;

    /// Side-effect-free diagnostics: device, model name, static facts.
    fn get_model_info(&self) -> serde_json::Value;
}

/// Names of request parameters a backend will accept but ignore.
///
/// Shared classification so every adapter emits the same warning shape:
/// one warning-level event per ignored parameter, never an error.
pub fn ignored_parameters(
    request: &GenerationRequest,
    supports_negative_prompt: bool,
    supports_guidance: bool,
    backend_id: &'static str,
) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if !supports_negative_prompt && request.negative_prompt.is_some() {
        ignored.push("negative_prompt");
    }
    if !supports_guidance && request.guidance_scale.is_some() {
        ignored.push("guidance_scale");
    }
    if let Some(overrides) = &request.overrides {
        let matches_backend = match overrides {
            BackendOverrides::Flux(_) => backend_id == "flux",
            BackendOverrides::ZImage(_) => backend_id == "zimage",
        };
        if !matches_backend {
            ignored.push("overrides");
        }
    }
    ignored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_seed_fits_u32_range() {
        let request = GenerationRequest::new("test");
        for _ in 0..64 {
            assert!(request.resolve_seed() < (1u64 << 32));
        }
    }

    #[test]
    fn explicit_seed_wins() {
        let request = GenerationRequest {
            seed: Some(42),
            ..GenerationRequest::new("test")
        };
        assert_eq!(request.resolve_seed(), 42);
    }

    #[test]
    fn negative_prompt_flagged_once_for_guidance_free_backend() {
        let request = GenerationRequest {
            negative_prompt: Some("blurry".into()),
            ..GenerationRequest::new("test")
        };
        let ignored = ignored_parameters(&request, false, false, "zimage");
        assert_eq!(ignored, vec!["negative_prompt"]);
    }

    #[test]
    fn guidance_override_flagged_when_pinned() {
        let request = GenerationRequest {
            guidance_scale: Some(3.5),
            ..GenerationRequest::new("test")
        };
        assert_eq!(
            ignored_parameters(&request, false, false, "zimage"),
            vec!["guidance_scale"]
        );
        // The flux adapter accepts a guidance override.
        assert!(ignored_parameters(&request, false, true, "flux").is_empty());
    }

    #[test]
    fn foreign_overrides_are_flagged() {
        let request = GenerationRequest {
            overrides: Some(BackendOverrides::Flux(FluxOverrides {
                max_sequence_length: Some(128),
            })),
            ..GenerationRequest::new("test")
        };
        assert_eq!(
            ignored_parameters(&request, true, true, "zimage"),
            vec!["overrides"]
        );
        assert!(ignored_parameters(&request, true, true, "flux").is_empty());
    }

    #[test]
    fn trait_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ImageGenerator>();
    }
}
