//! Backend selection.
//!
//! The configured `image_model` string picks which generator gets built.
//! Selection is case-insensitive; an unrecognized value is a hard error that
//! echoes the offending string alongside the accepted set.

use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use tracing::info;

use crate::config::Config;
use crate::error::{GeneratorError, Result};
use crate::flux::{FluxGenerator, FLUX_MODEL_ID};
use crate::generator::ImageGenerator;
use crate::mock::{MockGenerator, MOCK_MODEL_ID};
use crate::zimage::{self, ZImageGenerator, ZIMAGE_MODEL_ID};

/// Selector values accepted in config files and CLI overrides.
pub const ACCEPTED_MODELS: &[&str] = &[FLUX_MODEL_ID, ZIMAGE_MODEL_ID];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ModelKind {
    Flux,
    ZImage,
}

fn parse_model(value: &str) -> Result<ModelKind> {
    serde_plain::from_str(&value.to_lowercase()).map_err(|_| GeneratorError::UnknownModel {
        value: value.to_string(),
        expected: ACCEPTED_MODELS,
    })
}

/// Build the generator named by `config.model.image_model`.
///
/// With `mock` set the configured backend is ignored entirely and a
/// deterministic in-process generator is returned instead; nothing touches
/// the hub or the local checkpoint tree on that path.
pub fn get_image_generator(
    config: Arc<Config>,
    mock: bool,
) -> Result<Box<dyn ImageGenerator>> {
    if mock {
        info!(model = MOCK_MODEL_ID, "using mock generator");
        return Ok(Box::new(MockGenerator::new(config)?));
    }
    let selector = config.model.image_model.clone();
    match parse_model(&selector)? {
        ModelKind::Flux => {
            info!(model = FLUX_MODEL_ID, "selected FLUX backend");
            Ok(Box::new(FluxGenerator::new(config)?))
        }
        ModelKind::ZImage => {
            info!(model = ZIMAGE_MODEL_ID, "selected Z-Image backend");
            // Surface a missing checkpoint tree as a model problem at this
            // boundary so the caller gets one error kind for "backend not
            // obtainable", remediation included.
            let generator = ZImageGenerator::new(config).map_err(|e| match e {
                GeneratorError::SourceUnavailable { path, remediation } => {
                    GeneratorError::ModelUnavailable {
                        reason: format!("Z-Image checkpoint not found at {}", path.display()),
                        remediation,
                    }
                }
                other => other,
            })?;
            Ok(Box::new(generator))
        }
    }
}

static ZIMAGE_PROBE: OnceLock<bool> = OnceLock::new();

/// Report which backends could be constructed under this config.
///
/// FLUX pulls its weights from the hub on demand, so it is always listed.
/// Z-Image needs a local checkpoint tree; the filesystem probe runs once
/// and the answer is cached for the life of the process.
pub fn get_available_models(config: &Config) -> Vec<&'static str> {
    available_models(config, &ZIMAGE_PROBE)
}

fn available_models(config: &Config, probe: &OnceLock<bool>) -> Vec<&'static str> {
    let mut models = vec![FLUX_MODEL_ID];
    let zimage_present =
        *probe.get_or_init(|| zimage::resolve_source(&config.model.zimage_model_path).is_ok());
    if zimage_present {
        models.push(ZIMAGE_MODEL_ID);
    }
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_with_model(model: &str) -> Arc<Config> {
        let mut config = Config::default();
        config.model.image_model = model.to_string();
        Arc::new(config)
    }

    #[test]
    fn unknown_model_names_the_offender() {
        let err = get_image_generator(config_with_model("bogus"), false)
            .err()
            .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("bogus"), "{msg}");
        assert!(msg.contains("flux"), "{msg}");
        assert!(msg.contains("zimage"), "{msg}");
    }

    #[test]
    fn selector_is_case_insensitive() {
        assert_eq!(parse_model("FLUX").unwrap(), ModelKind::Flux);
        assert_eq!(parse_model("ZImage").unwrap(), ModelKind::ZImage);
    }

    #[test]
    fn mock_flag_overrides_selector() {
        let generator = get_image_generator(config_with_model("bogus"), true).unwrap();
        assert_eq!(generator.id(), MOCK_MODEL_ID);
    }

    #[test]
    fn zimage_without_checkpoint_reports_remediation() {
        let mut config = Config::default();
        config.system.cpu_only = true;
        config.model.image_model = "zimage".to_string();
        config.model.zimage_model_path = std::path::PathBuf::from("/nonexistent/z-image");
        let err = get_image_generator(Arc::new(config), false).err().unwrap();
        assert!(matches!(err, GeneratorError::ModelUnavailable { .. }));
        let msg = err.to_string();
        assert!(msg.contains("huggingface-cli download Tongyi-MAI/Z-Image-Turbo"), "{msg}");
    }

    #[test]
    fn zimage_listed_only_with_local_checkpoint() {
        let mut config = Config::default();
        config.model.zimage_model_path = std::path::PathBuf::from("/nonexistent/z-image");
        assert_eq!(
            available_models(&config, &OnceLock::new()),
            vec![FLUX_MODEL_ID]
        );

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("transformer")).unwrap();
        config.model.zimage_model_path = dir.path().to_path_buf();
        assert_eq!(
            available_models(&config, &OnceLock::new()),
            vec![FLUX_MODEL_ID, ZIMAGE_MODEL_ID]
        );
    }

    #[test]
    fn capability_probe_is_evaluated_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.model.zimage_model_path = dir.path().to_path_buf();

        let probe = OnceLock::new();
        assert_eq!(available_models(&config, &probe), vec![FLUX_MODEL_ID]);

        // The checkpoint appearing later does not change the cached answer.
        std::fs::create_dir(dir.path().join("transformer")).unwrap();
        assert_eq!(available_models(&config, &probe), vec![FLUX_MODEL_ID]);
    }
}
