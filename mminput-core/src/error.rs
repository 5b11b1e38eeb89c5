use thiserror::Error;

use crate::architecture::ModelIdentity;

#[derive(Error, Debug)]
pub enum MultiModalError {
    #[error("No input mapper in {plugin} is registered for model class {model}.")]
    UnregisteredMapper { plugin: String, model: ModelIdentity },

    #[error("Invalid {modality} input of type `{found}`: {reason}")]
    UnsupportedModality {
        modality: String,
        found: String,
        reason: String,
    },

    #[error("No maximum number of multi-modal tokens is given for model class {model} in {plugin}.")]
    UnregisteredEstimator { plugin: String, model: ModelIdentity },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Input mapper for model class {model} does not accept processor kwargs {keys:?}.")]
    UnknownProcessorKwargs {
        model: ModelIdentity,
        keys: Vec<String>,
    },

    #[error("Could not resolve a model architecture for `{model}`.")]
    UnresolvedArchitecture { model: String },

    #[error("There is no default {what} for the {modality} modality.")]
    MissingDefault {
        modality: &'static str,
        what: &'static str,
    },

    #[error("No multi-modal plugin is registered for data key `{0}`.")]
    UnknownModality(String),

    #[error("At most {limit} {modality} item(s) are allowed per prompt (`limit_mm_per_prompt`), but found {count} in the same prompt.")]
    TooManyItems {
        modality: String,
        count: usize,
        limit: usize,
    },

    #[error("The input mappers (keys={modalities:?}) resulted in a conflicting keyword argument: {field}")]
    ConflictingField {
        field: String,
        modalities: Vec<String>,
    },

    #[error("Processor error: {0}")]
    Processor(#[from] anyhow::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("IoError: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0:?}")]
    Json(#[from] serde_json::Error),
}

impl MultiModalError {
    pub fn unsupported(
        modality: impl Into<String>,
        found: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedModality {
            modality: modality.into(),
            found: found.into(),
            reason: reason.into(),
        }
    }

    /// `true` if the failure is confined to one request (bad payload, kwargs or item count)
    /// and the request should be rejected without affecting the rest of the batch.
    /// Everything else is a registration or configuration gap.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedModality { .. }
                | Self::UnknownProcessorKwargs { .. }
                | Self::TooManyItems { .. }
                | Self::ConflictingField { .. }
                | Self::UnknownModality(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MultiModalError>;
