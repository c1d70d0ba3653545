use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::Device;
use image::DynamicImage;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::device::{device_name, select_device};
use crate::error::Result;
use crate::generator::{
    ignored_parameters, GenerationRequest, GenerationResult, ImageGenerator,
};
use crate::output::save_image;

pub const MOCK_MODEL_ID: &str = "mock";

/// Deterministic, accelerator-free generator for tests and CI.
///
/// Pixels are a pure function of (seed, x, y), so identical requests
/// produce identical files regardless of host hardware.
pub struct MockGenerator {
    config: Arc<Config>,
    device: Device,
    loaded: AtomicBool,
}

impl MockGenerator {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let device = select_device(config.system.cpu_only)?;
        Ok(Self {
            config,
            device,
            loaded: AtomicBool::new(false),
        })
    }

    fn render(width: usize, height: usize, seed: u64) -> DynamicImage {
        let image = image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let v = (x as u64)
                .wrapping_mul(31)
                .wrapping_add((y as u64).wrapping_mul(17))
                .wrapping_add(seed.wrapping_mul(0x9e37_79b9));
            image::Rgb([(v & 0xff) as u8, ((v >> 8) & 0xff) as u8, ((v >> 16) & 0xff) as u8])
        });
        DynamicImage::ImageRgb8(image)
    }
}

#[async_trait]
impl ImageGenerator for MockGenerator {
    fn id(&self) -> &'static str {
        MOCK_MODEL_ID
    }

    async fn load_model(&self) -> Result<()> {
        if !self.loaded.swap(true, Ordering::SeqCst) {
            info!("mock generator loaded (no weights)");
        }
        Ok(())
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        if !self.is_loaded() {
            self.load_model().await?;
        }

        for param in ignored_parameters(&request, false, false, MOCK_MODEL_ID) {
            warn!(backend = MOCK_MODEL_ID, "ignoring unsupported parameter: {param}");
        }

        let height = request.height.unwrap_or(self.config.image.height);
        let width = request.width.unwrap_or(self.config.image.width);
        let steps = request
            .num_inference_steps
            .unwrap_or(self.config.image.num_inference_steps);
        let seed = request.resolve_seed();

        let image = Self::render(width, height, seed);
        let image_path = save_image(&image, &self.config.system.output_dir, &request.prompt)?;

        let mut metadata = serde_json::Map::new();
        metadata.insert("height".into(), json!(height));
        metadata.insert("width".into(), json!(width));
        metadata.insert("guidance_scale".into(), json!(0.0));
        metadata.insert("device".into(), json!(device_name(&self.device)));

        Ok(GenerationResult {
            image_path,
            prompt: request.prompt,
            model: MOCK_MODEL_ID.to_string(),
            seed,
            steps,
            metadata,
        })
    }

    fn cleanup(&self) {
        self.loaded.store(false, Ordering::SeqCst);
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn get_model_info(&self) -> serde_json::Value {
        json!({
            "model_type": "MockGenerator",
            "model_name": MOCK_MODEL_ID,
            "device": device_name(&self.device),
            "deterministic": true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_deterministic_per_seed() {
        let a = MockGenerator::render(16, 16, 42);
        let b = MockGenerator::render(16, 16, 42);
        let c = MockGenerator::render(16, 16, 43);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }
}
