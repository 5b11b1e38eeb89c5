use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::Result;

/// Keyword overrides for multi-modal processors, e.g. `{"num_crops": 4}`.
pub type ProcessorKwargs = IndexMap<String, Value>;

/// The subset of a model's configuration the multi-modal layer reads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Local model directory or hub id.
    pub model: String,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub trust_remote_code: bool,
    /// Init-time processor overrides, applied to every request.
    #[serde(default)]
    pub mm_processor_kwargs: Option<ProcessorKwargs>,
    /// Maximum items per prompt for each modality. `None` allows one item of every modality; a map
    /// whose values are all zero disables multi-modal input.
    #[serde(default)]
    pub limit_mm_per_prompt: Option<IndexMap<String, usize>>,
    /// The raw `config.json`.
    #[serde(default)]
    pub hf_config: Value,
}

#[derive(Deserialize)]
struct HfConfigHeader {
    #[serde(default)]
    architectures: Vec<String>,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Read `config.json` from a local model directory.
    pub fn from_model_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join("config.json");
        info!("Loading `config.json` at `{}`", path.display());
        let raw = fs::read_to_string(&path)?;
        let hf_config: Value = serde_json::from_str(&raw)?;
        let HfConfigHeader { architectures } = serde_json::from_value(hf_config.clone())?;
        Ok(Self {
            model: dir.display().to_string(),
            architectures,
            hf_config,
            ..Default::default()
        })
    }

    pub fn with_architectures<I, S>(mut self, architectures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.architectures = architectures.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_trust_remote_code(mut self, trust_remote_code: bool) -> Self {
        self.trust_remote_code = trust_remote_code;
        self
    }

    pub fn with_mm_processor_kwargs(mut self, kwargs: ProcessorKwargs) -> Self {
        self.mm_processor_kwargs = Some(kwargs);
        self
    }

    pub fn with_limit_mm_per_prompt<I, S>(mut self, limits: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        self.limit_mm_per_prompt = Some(limits.into_iter().map(|(k, v)| (k.into(), v)).collect());
        self
    }

    pub fn with_hf_config(mut self, hf_config: Value) -> Self {
        self.hf_config = hf_config;
        self
    }

    pub fn model_dir(&self) -> PathBuf {
        PathBuf::from(&self.model)
    }

    /// Look up a non-negative integer in `config.json` by key path.
    pub fn hf_config_usize(&self, path: &[&str]) -> Option<usize> {
        let mut current = &self.hf_config;
        for key in path {
            current = current.get(*key)?;
        }
        current.as_u64().and_then(|v| usize::try_from(v).ok())
    }
}
