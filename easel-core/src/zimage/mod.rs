//! Z-Image Turbo backend.
//!
//! Unlike the FLUX pipeline this backend is disaggregated: the checkpoint
//! directory holds separately-packaged components (transformer, VAE, text
//! encoder, tokenizer, scheduler) and generation is a free function over
//! them rather than a monolithic pipeline call.
//!
//! Expected layout under `model.zimage_model_path`:
//!
//! ```text
//! transformer/config.json + *.safetensors
//! text_encoder/config.json + *.safetensors
//! vae/*.safetensors            (FLUX-format 16-channel autoencoder)
//! tokenizer/tokenizer.json
//! scheduler/config.json        (optional, defaults apply)
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::flux::autoencoder::{self, AutoEncoder};
use serde_json::json;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::config::Config;
use crate::device::{device_name, reclaim_device_memory, select_device};
use crate::error::{GeneratorError, Result};
use crate::generator::{
    ignored_parameters, GenerationRequest, GenerationResult, ImageGenerator,
};
use crate::output::save_image;
use crate::util::tensor_to_image;

pub mod attention;
pub mod model;
pub mod sampling;
pub mod scheduler;
pub mod text_encoder;

pub use attention::{set_attention_backend, AttentionBackend};

use model::{ZImageTransformer, ZImageTransformerConfig};
use sampling::SamplingParams;
use scheduler::{FlowMatchScheduler, SchedulerConfig};
use text_encoder::{TextEncoder, TextEncoderConfig};

pub const ZIMAGE_MODEL_ID: &str = "zimage";

/// Turbo checkpoints are distilled for 8 guidance-free steps.
pub const ZIMAGE_DEFAULT_STEPS: usize = 8;

pub fn remediation(path: &Path) -> String {
    format!(
        "huggingface-cli download Tongyi-MAI/Z-Image-Turbo --local-dir {}",
        path.display()
    )
}

/// Verify the component tree exists before attempting any load.
pub fn resolve_source(model_path: &Path) -> Result<()> {
    if model_path.join("transformer").is_dir() {
        Ok(())
    } else {
        Err(GeneratorError::SourceUnavailable {
            path: model_path.to_path_buf(),
            remediation: remediation(model_path),
        })
    }
}

/// The loaded component set, owned exclusively by the generator.
pub struct ZImageComponents {
    pub transformer: ZImageTransformer,
    pub vae: AutoEncoder,
    pub text_encoder: TextEncoder,
    pub tokenizer: Tokenizer,
    pub scheduler: FlowMatchScheduler,
}

fn safetensor_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(GeneratorError::ModelUnavailable {
            reason: format!("no safetensors files in {}", dir.display()),
            remediation: remediation(dir.parent().unwrap_or(dir)),
        });
    }
    Ok(files)
}

fn load_components(model_path: &Path, device: &Device, dtype: DType) -> Result<ZImageComponents> {
    let transformer_dir = model_path.join("transformer");
    let transformer_config: ZImageTransformerConfig = serde_json::from_str(
        &std::fs::read_to_string(transformer_dir.join("config.json"))?,
    )
    .map_err(|e| GeneratorError::Config(format!("transformer/config.json: {e}")))?;
    let transformer_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&safetensor_files(&transformer_dir)?, dtype, device)?
    };
    let transformer = ZImageTransformer::new(&transformer_config, transformer_vb)?;
    info!(layers = transformer_config.num_layers, "loaded transformer");

    let encoder_dir = model_path.join("text_encoder");
    let encoder_config: TextEncoderConfig = serde_json::from_str(&std::fs::read_to_string(
        encoder_dir.join("config.json"),
    )?)
    .map_err(|e| GeneratorError::Config(format!("text_encoder/config.json: {e}")))?;
    let encoder_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&safetensor_files(&encoder_dir)?, dtype, device)?
    };
    let text_encoder = TextEncoder::new(&encoder_config, encoder_vb)?;
    info!(layers = encoder_config.num_hidden_layers, "loaded text encoder");

    let vae_vb = unsafe {
        VarBuilder::from_mmaped_safetensors(
            &safetensor_files(&model_path.join("vae"))?,
            dtype,
            device,
        )?
    };
    let vae = AutoEncoder::new(&autoencoder::Config::schnell(), vae_vb)?;

    let tokenizer = Tokenizer::from_file(model_path.join("tokenizer").join("tokenizer.json"))
        .map_err(GeneratorError::tokenizer)?;

    let scheduler_config_path = model_path.join("scheduler").join("config.json");
    let scheduler_config: SchedulerConfig = if scheduler_config_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(scheduler_config_path)?)
            .map_err(|e| GeneratorError::Config(format!("scheduler/config.json: {e}")))?
    } else {
        SchedulerConfig::default()
    };
    let scheduler = FlowMatchScheduler::new(&scheduler_config);

    Ok(ZImageComponents {
        transformer,
        vae,
        text_encoder,
        tokenizer,
        scheduler,
    })
}

/// Z-Image Turbo generator over the disaggregated component set.
pub struct ZImageGenerator {
    config: Arc<Config>,
    device: Device,
    dtype: DType,
    model_path: PathBuf,
    attention_backend: AttentionBackend,
    compile_model: bool,
    components: Mutex<Option<Arc<ZImageComponents>>>,
}

impl ZImageGenerator {
    /// Construction is cheap: it resolves the device and validates the
    /// source tree, but loads no weights.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let device = select_device(config.system.cpu_only)?;
        let model_path = config.model.zimage_model_path.clone();
        resolve_source(&model_path)?;
        let attention_backend: AttentionBackend = config.model.zimage_attention.parse()?;
        let dtype = device.bf16_default_to_f32();
        Ok(Self {
            compile_model: config.model.zimage_compile,
            config,
            device,
            dtype,
            model_path,
            attention_backend,
            components: Mutex::new(None),
        })
    }

    fn loaded_components(&self) -> Option<Arc<ZImageComponents>> {
        self.components
            .lock()
            .expect("components lock poisoned")
            .clone()
    }

    fn warmup(&self, components: &ZImageComponents) {
        // Pre-builds device kernels so the first request is not the slow
        // one. Failure falls back to eager execution.
        let params = SamplingParams {
            height: 64,
            width: 64,
            num_inference_steps: 1,
            seed: 0,
        };
        if let Err(e) = sampling::generate(
            &components.transformer,
            &components.vae,
            &components.text_encoder,
            &components.tokenizer,
            &components.scheduler,
            "warmup",
            &params,
            &self.device,
            self.dtype,
        ) {
            warn!("warmup pass failed, continuing with eager execution: {e}");
        }
    }
}

#[async_trait]
impl ImageGenerator for ZImageGenerator {
    fn id(&self) -> &'static str {
        ZIMAGE_MODEL_ID
    }

    async fn load_model(&self) -> Result<()> {
        if self.loaded_components().is_some() {
            return Ok(());
        }
        resolve_source(&self.model_path)?;
        info!(
            path = %self.model_path.display(),
            device = device_name(&self.device),
            attention = self.attention_backend.as_str(),
            compile = self.compile_model,
            "loading Z-Image components"
        );
        set_attention_backend(self.attention_backend);
        let components = load_components(&self.model_path, &self.device, self.dtype)?;
        if self.compile_model && !matches!(self.device, Device::Cpu) {
            self.warmup(&components);
        }
        let mut guard = self.components.lock().expect("components lock poisoned");
        // A concurrent load may have won the race; keep the first set.
        if guard.is_none() {
            *guard = Some(Arc::new(components));
        }
        info!("Z-Image components loaded");
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        if self.loaded_components().is_none() {
            self.load_model().await?;
        }
        let components = self
            .loaded_components()
            .ok_or_else(|| GeneratorError::ModelUnavailable {
                reason: "components not loaded".into(),
                remediation: remediation(&self.model_path),
            })?;

        for param in ignored_parameters(&request, false, false, ZIMAGE_MODEL_ID) {
            warn!(
                backend = ZIMAGE_MODEL_ID,
                "ignoring unsupported parameter: {param}"
            );
        }

        let params = SamplingParams {
            height: request.height.unwrap_or(self.config.image.height),
            width: request.width.unwrap_or(self.config.image.width),
            num_inference_steps: request.num_inference_steps.unwrap_or(ZIMAGE_DEFAULT_STEPS),
            seed: request.resolve_seed(),
        };
        info!(
            height = params.height,
            width = params.width,
            steps = params.num_inference_steps,
            seed = params.seed,
            "generating with Z-Image"
        );

        let device = self.device.clone();
        let dtype = self.dtype;
        let prompt = request.prompt.clone();
        let worker_params = params.clone();
        // The sampling loop is pure compute; hand it to a blocking worker so
        // the caller's event loop stays responsive.
        let image_tensor = tokio::task::spawn_blocking(move || {
            sampling::generate(
                &components.transformer,
                &components.vae,
                &components.text_encoder,
                &components.tokenizer,
                &components.scheduler,
                &prompt,
                &worker_params,
                &device,
                dtype,
            )
        })
        .await??;

        let image = tensor_to_image(&image_tensor)?;
        let image_path = save_image(&image, &self.config.system.output_dir, &request.prompt)?;
        info!(path = %image_path.display(), "image saved");

        let mut metadata = serde_json::Map::new();
        metadata.insert("model".into(), json!("Z-Image-Turbo"));
        metadata.insert("model_path".into(), json!(self.model_path.display().to_string()));
        metadata.insert("height".into(), json!(params.height));
        metadata.insert("width".into(), json!(params.width));
        // Distilled for guidance-free sampling; always pinned.
        metadata.insert("guidance_scale".into(), json!(0.0));
        metadata.insert("attention_backend".into(), json!(self.attention_backend.as_str()));
        metadata.insert("compiled".into(), json!(self.compile_model));
        metadata.insert("device".into(), json!(device_name(&self.device)));

        Ok(GenerationResult {
            image_path,
            prompt: request.prompt,
            model: ZIMAGE_MODEL_ID.to_string(),
            seed: params.seed,
            steps: params.num_inference_steps,
            metadata,
        })
    }

    fn cleanup(&self) {
        let dropped = self
            .components
            .lock()
            .expect("components lock poisoned")
            .take();
        if dropped.is_some() {
            reclaim_device_memory(&self.device);
            info!("Z-Image components released");
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded_components().is_some()
    }

    fn get_model_info(&self) -> serde_json::Value {
        json!({
            "model_type": "ZImageGenerator",
            "model_name": "Z-Image-Turbo",
            "model_path": self.model_path.display().to_string(),
            "device": device_name(&self.device),
            "architecture": "Single-Stream DiT (S3-DiT)",
            "inference_steps": ZIMAGE_DEFAULT_STEPS,
            "attention_backend": self.attention_backend.as_str(),
            "compiled": self.compile_model,
            "loaded": self.is_loaded(),
        })
    }
}

impl Drop for ZImageGenerator {
    // Safety net; explicit cleanup at the call site is preferred.
    fn drop(&mut self) {
        self.cleanup();
    }
}
