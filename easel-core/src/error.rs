use std::path::PathBuf;

/// Errors surfaced by generator construction, loading and generation.
///
/// Load-time failures carry remediation text so an operator without source
/// access can act on them. Per-call parameter mismatches never show up here;
/// they are downgraded to warnings and generation proceeds.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("requested device unavailable: {0}")]
    Device(String),

    #[error("model weights unavailable: {reason}. Remediation: {remediation}")]
    ModelUnavailable { reason: String, remediation: String },

    #[error("source tree not found at {path}. Remediation: {remediation}")]
    SourceUnavailable { path: PathBuf, remediation: String },

    #[error("unknown image model type: {value:?}. Expected one of {expected:?}")]
    UnknownModel {
        value: String,
        expected: &'static [&'static str],
    },

    #[error("inference error: {0}")]
    Inference(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("hub download failed: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),

    #[error("image encode/save failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("generation worker terminated: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl GeneratorError {
    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T, E = GeneratorError> = std::result::Result<T, E>;
