//! FLUX backend: one monolithic pipeline object loaded from the hub.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::clip::text_model::{self as clip, ClipTextTransformer};
use candle_transformers::models::flux::{
    autoencoder::{self, AutoEncoder},
    model::{self, Flux},
    sampling,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::tokio::{Api, ApiRepo};
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
use crate::util::{seeded_randn, tensor_to_image};

pub const FLUX_MODEL_ID: &str = "flux";

/// T5's trained position budget; requests above this are clamped.
const MAX_T5_TOKENS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect the variant from the hub model name.
    pub fn from_name(model_name: &str) -> Self {
        if model_name.to_uppercase().contains("DEV") {
            Self::Dev
        } else {
            Self::Schnell
        }
    }

    fn weight_file(&self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }
}

/// The loaded pipeline: text encoders, autoencoder and denoiser as one unit.
pub struct FluxPipeline {
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

async fn fetch(repo: &ApiRepo, file: &str, model_name: &str) -> Result<std::path::PathBuf> {
    repo.get(file)
        .await
        .map_err(|e| GeneratorError::ModelUnavailable {
            reason: format!("failed to fetch {file} for {model_name}: {e}"),
            remediation: format!(
                "check network/credentials or pre-download with: huggingface-cli download {model_name}"
            ),
        })
}

impl FluxPipeline {
    async fn load(model_name: &str, device: &Device, dtype: DType) -> Result<Self> {
        let api = Api::new().map_err(|e| GeneratorError::ModelUnavailable {
            reason: format!("failed to initialize hub client: {e}"),
            remediation: "ensure the HF cache directory is writable".to_string(),
        })?;

        // T5 encoder + tokenizer.
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model_file = fetch(&t5_repo, "model.safetensors", "google/t5-v1_1-xxl").await?;
        let t5_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[t5_model_file], dtype, device)? };
        let t5_config_file = fetch(&t5_repo, "config.json", "google/t5-v1_1-xxl").await?;
        let t5_config: t5::Config =
            serde_json::from_str(&std::fs::read_to_string(&t5_config_file)?)
                .map_err(|e| GeneratorError::Config(format!("t5 config: {e}")))?;
        let t5_model = T5EncoderModel::load(t5_vb, &t5_config)?;
        let t5_tokenizer_file = fetch(
            &api.repo(hf_hub::Repo::model("lmz/mt5-tokenizers".to_string())),
            "t5-v1_1-xxl.tokenizer.json",
            "lmz/mt5-tokenizers",
        )
        .await?;
        let t5_tokenizer =
            Tokenizer::from_file(t5_tokenizer_file).map_err(GeneratorError::tokenizer)?;

        // CLIP encoder + tokenizer.
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model_file = fetch(
            &clip_repo,
            "model.safetensors",
            "openai/clip-vit-large-patch14",
        )
        .await?;
        let clip_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[clip_model_file], dtype, device)? };
        let clip_config = clip::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: clip::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)?;
        let clip_tokenizer_file = fetch(
            &clip_repo,
            "tokenizer.json",
            "openai/clip-vit-large-patch14",
        )
        .await?;
        let clip_tokenizer =
            Tokenizer::from_file(clip_tokenizer_file).map_err(GeneratorError::tokenizer)?;

        // Autoencoder and denoiser from the FLUX repo itself.
        let variant = FluxVariant::from_name(model_name);
        let bf_repo = api.repo(hf_hub::Repo::model(model_name.to_string()));
        let autoencoder_file = fetch(&bf_repo, "ae.safetensors", model_name).await?;
        let autoencoder_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[autoencoder_file], dtype, device)? };
        let (autoencoder_config, flux_config) = match variant {
            FluxVariant::Schnell => (autoencoder::Config::schnell(), model::Config::schnell()),
            FluxVariant::Dev => (autoencoder::Config::dev(), model::Config::dev()),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)?;

        let flux_file = fetch(&bf_repo, variant.weight_file(), model_name).await?;
        let flux_vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[flux_file], dtype, device)? };
        let flux_model = Flux::new(&flux_config, flux_vb)?;

        Ok(Self {
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }

    /// Run the full pipeline for one request. Blocking; callers dispatch
    /// this to a worker thread.
    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        prompt: &str,
        width: usize,
        height: usize,
        steps: usize,
        guidance: f64,
        seed: u64,
        max_sequence_length: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        // Seeded host-side noise; the packed latent grid is 16 channels at
        // two tokens per 16-pixel tile on each axis.
        let noise_h = height.div_ceil(16) * 2;
        let noise_w = width.div_ceil(16) * 2;
        let noise_img = seeded_randn(seed, (1, 16, noise_h, noise_w), device)?.to_dtype(dtype)?;

        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(GeneratorError::tokenizer)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(max_sequence_length.min(MAX_T5_TOKENS), 0);
        let t5_ids = Tensor::new(&*t5_tokens, device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&t5_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(GeneratorError::tokenizer)?
            .get_ids()
            .to_vec();
        let clip_ids = Tensor::new(&*clip_tokens, device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&clip_ids)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = sampling::get_schedule(steps, None);

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            guidance,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;

        let decoded = self.autoencoder.decode(&unpacked)?;
        let image = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        Ok(image.i(0)?)
    }
}

/// FLUX generator: single pipeline object, hub-sourced weights.
pub struct FluxGenerator {
    config: Arc<Config>,
    device: Device,
    dtype: DType,
    model_name: String,
    variant: FluxVariant,
    compile_model: bool,
    pipeline: Arc<Mutex<Option<FluxPipeline>>>,
}

impl FluxGenerator {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let device = select_device(config.system.cpu_only)?;
        let dtype = device.bf16_default_to_f32();
        let model_name = config.model.flux_model.clone();
        let variant = FluxVariant::from_name(&model_name);
        Ok(Self {
            compile_model: config.model.flux_compile,
            config,
            device,
            dtype,
            model_name,
            variant,
            pipeline: Arc::new(Mutex::new(None)),
        })
    }

    /// One tiny end-to-end pass that pre-builds device kernels so the first
    /// real request is not the slow one. Failure falls back to eager
    /// execution.
    async fn warmup(&self) -> Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let device = self.device.clone();
        let dtype = self.dtype;
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = pipeline.lock().expect("pipeline lock poisoned");
            match guard.as_mut() {
                Some(pipeline) => pipeline
                    .run("warmup", 64, 64, 1, 0.0, 0, 16, &device, dtype)
                    .map(|_| ()),
                None => Ok(()),
            }
        })
        .await?;
        if let Err(e) = outcome {
            warn!("warmup pass failed, continuing with eager execution: {e}");
        }
        Ok(())
    }
}

#[async_trait]
impl ImageGenerator for FluxGenerator {
    fn id(&self) -> &'static str {
        FLUX_MODEL_ID
    }

    async fn load_model(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        info!(
            model = %self.model_name,
            variant = ?self.variant,
            device = device_name(&self.device),
            "loading FLUX pipeline"
        );
        if matches!(self.device, Device::Cpu) {
            warn!("FLUX on CPU: device memory optimizations unavailable, generation will be slow");
        }
        let pipeline = FluxPipeline::load(&self.model_name, &self.device, self.dtype).await?;
        // Scoped so the guard is dead before the await below; the future
        // must stay Send.
        {
            let mut guard = self.pipeline.lock().expect("pipeline lock poisoned");
            // A concurrent load may have won the race; keep the first pipeline.
            if guard.is_none() {
                *guard = Some(pipeline);
            }
        }
        info!("FLUX pipeline loaded");
        if self.compile_model && !matches!(self.device, Device::Cpu) {
            self.warmup().await?;
        }
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        if !self.is_loaded() {
            self.load_model().await?;
        }

        for param in ignored_parameters(&request, false, true, FLUX_MODEL_ID) {
            warn!(
                backend = FLUX_MODEL_ID,
                "ignoring unsupported parameter: {param}"
            );
        }

        let height = request.height.unwrap_or(self.config.image.height);
        let width = request.width.unwrap_or(self.config.image.width);
        let steps = request
            .num_inference_steps
            .unwrap_or(self.config.image.num_inference_steps);
        let guidance = request
            .guidance_scale
            .unwrap_or(self.config.image.guidance_scale);
        let seed = request.resolve_seed();
        let max_sequence_length = request
            .flux_overrides()
            .and_then(|o| o.max_sequence_length)
            .unwrap_or(self.config.model.max_sequence_length);
        info!(height, width, steps, guidance, seed, "generating with FLUX");

        let pipeline = Arc::clone(&self.pipeline);
        let device = self.device.clone();
        let dtype = self.dtype;
        let model_name = self.model_name.clone();
        let prompt = request.prompt.clone();
        let image_tensor = tokio::task::spawn_blocking(move || {
            let mut guard = pipeline.lock().expect("pipeline lock poisoned");
            let pipeline = guard
                .as_mut()
                .ok_or_else(|| GeneratorError::ModelUnavailable {
                    reason: "pipeline unloaded during generation".into(),
                    remediation: format!("reload with: huggingface-cli download {model_name}"),
                })?;
            pipeline.run(
                &prompt,
                width,
                height,
                steps,
                guidance,
                seed,
                max_sequence_length,
                &device,
                dtype,
            )
        })
        .await??;

        let image = tensor_to_image(&image_tensor)?;
        let image_path = save_image(&image, &self.config.system.output_dir, &request.prompt)?;
        info!(path = %image_path.display(), "image saved");

        let mut metadata = serde_json::Map::new();
        metadata.insert("model".into(), json!(self.model_name));
        metadata.insert("height".into(), json!(height));
        metadata.insert("width".into(), json!(width));
        metadata.insert("guidance_scale".into(), json!(guidance));
        metadata.insert("max_sequence_length".into(), json!(max_sequence_length));
        metadata.insert("compiled".into(), json!(self.compile_model));
        metadata.insert("device".into(), json!(device_name(&self.device)));

        Ok(GenerationResult {
            image_path,
            prompt: request.prompt,
            model: FLUX_MODEL_ID.to_string(),
            seed,
            steps,
            metadata,
        })
    }

    fn cleanup(&self) {
        let dropped = self
            .pipeline
            .lock()
            .expect("pipeline lock poisoned")
            .take();
        if dropped.is_some() {
            reclaim_device_memory(&self.device);
            info!("FLUX pipeline released");
        }
    }

    fn is_loaded(&self) -> bool {
        self.pipeline
            .lock()
            .expect("pipeline lock poisoned")
            .is_some()
    }

    fn get_model_info(&self) -> serde_json::Value {
        json!({
            "model_type": "FluxGenerator",
            "model_name": self.model_name,
            "variant": format!("{:?}", self.variant),
            "device": device_name(&self.device),
            "compiled": self.compile_model,
            "loaded": self.is_loaded(),
        })
    }
}

impl Drop for FluxGenerator {
    // Safety net; explicit cleanup at the call site is preferred.
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_detection_from_model_name() {
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            FluxVariant::Schnell
        );
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-dev"),
            FluxVariant::Dev
        );
        // Unknown names default to the distilled variant.
        assert_eq!(FluxVariant::from_name("custom/model"), FluxVariant::Schnell);
    }

    #[test]
    fn construction_is_cheap_and_unloaded() {
        let mut config = Config::default();
        config.system.cpu_only = true;
        let generator = FluxGenerator::new(Arc::new(config)).unwrap();
        assert!(!generator.is_loaded());
        generator.cleanup();
        assert!(!generator.is_loaded());
        assert_eq!(generator.id(), "flux");
        let info = generator.get_model_info();
        assert_eq!(info["compiled"], false);
    }

    #[test]
    fn load_future_is_send() {
        // The lock guard in load_model must not be live across an await;
        // constructing the future (without driving it) proves Send-ness.
        fn assert_send<T: Send>(_: &T) {}
        let mut config = Config::default();
        config.system.cpu_only = true;
        let generator = FluxGenerator::new(Arc::new(config)).unwrap();
        let future = generator.load_model();
        assert_send(&future);
        drop(future);
    }
}
