pub mod config;
pub mod device;
pub mod error;
pub mod factory;
pub mod flux;
pub mod generator;
pub mod mock;
pub mod output;
pub mod plugin;
pub mod zimage;

mod util;

pub use config::Config;
pub use device::{device_name, select_device};
pub use error::{GeneratorError, Result};
pub use factory::{get_available_models, get_image_generator, ACCEPTED_MODELS};
pub use generator::{
    BackendOverrides, FluxOverrides, GenerationRequest, GenerationResult, ImageGenerator,
    ZImageOverrides,
};
pub use plugin::{PluginPipeline, PromptPlugin};
