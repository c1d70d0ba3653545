use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GeneratorError, Result};

/// Process configuration, deserialized from a TOML file.
///
/// Every section has usable defaults so tests and embedders can build a
/// `Config` directly and override individual fields.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub image: ImageConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Force CPU execution even when an accelerator is present.
    pub cpu_only: bool,
    /// Root directory for saved images and prompt sidecars.
    pub output_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            cpu_only: false,
            output_dir: PathBuf::from("./output"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageConfig {
    pub height: usize,
    pub width: usize,
    /// Default denoising step count; backends may override (Z-Image uses 8).
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            height: 768,
            width: 1360,
            num_inference_steps: 4,
            guidance_scale: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Factory selector: "flux" or "zimage", case-insensitive.
    pub image_model: String,
    /// Hub identifier for the FLUX pipeline.
    pub flux_model: String,
    /// Token budget for the T5 prompt encoder.
    pub max_sequence_length: usize,
    /// Run a warmup pass after loading FLUX to pre-build device kernels.
    pub flux_compile: bool,
    /// Local directory holding the Z-Image component weights.
    pub zimage_model_path: PathBuf,
    /// Attention backend selector for the Z-Image transformer.
    pub zimage_attention: String,
    /// Run a warmup pass after loading to pre-build device kernels.
    pub zimage_compile: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_model: "flux".to_string(),
            flux_model: "black-forest-labs/FLUX.1-schnell".to_string(),
            max_sequence_length: 256,
            flux_compile: false,
            zimage_model_path: PathBuf::from("./models/Z-Image-Turbo"),
            zimage_attention: "sdpa".to_string(),
            zimage_compile: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| GeneratorError::Config(format!("{}: {e}", path.display())))
    }
}
