use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::{
    architecture::ModelIdentity,
    config::{ModelConfig, ProcessorKwargs},
    data::{MultiModalDataDict, MultiModalDataExt},
    error::{MultiModalError, Result},
    inputs::MultiModalInputs,
    plugin::{InputMapper, MaxTokens, MultiModalPlugin},
    plugins::{AudioPlugin, ImagePlugin, VideoPlugin},
};

/// Per-prompt item limits of one model.
#[derive(Clone, Debug)]
struct ItemLimits {
    per_modality: IndexMap<String, usize>,
    /// Limit of a modality with no entry, e.g. a plugin registered after initialization.
    /// Zero when multi-modal input is disabled for the model.
    fallback: usize,
}

impl ItemLimits {
    fn get(&self, data_key: &str) -> usize {
        self.per_modality
            .get(data_key)
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Routes each modality of a request to its [`MultiModalPlugin`] and enforces the per-prompt
/// item limits of every model.
#[derive(Default)]
pub struct MultiModalRegistry {
    plugins: IndexMap<String, MultiModalPlugin>,
    limits_by_model: HashMap<String, ItemLimits>,
}

impl MultiModalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the image, audio and video plugins.
    pub fn with_builtin_plugins() -> Self {
        let mut registry = Self::new();
        registry.register_plugin(MultiModalPlugin::new(ImagePlugin::new()));
        registry.register_plugin(MultiModalPlugin::new(AudioPlugin));
        registry.register_plugin(MultiModalPlugin::new(VideoPlugin::new()));
        registry
    }

    pub fn register_plugin(&mut self, plugin: MultiModalPlugin) {
        let data_key = plugin.data_key().to_string();
        if let Some(existing) = self.plugins.get(&data_key) {
            warn!("A plugin is already registered for data type {data_key} ({existing}), and will be overwritten by the new plugin {plugin}.");
        }
        self.plugins.insert(data_key, plugin);
    }

    pub fn plugin(&self, data_key: &str) -> Option<&MultiModalPlugin> {
        self.plugins.get(data_key)
    }

    pub fn data_keys(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    fn plugin_mut(&mut self, data_key: &str) -> Result<&mut MultiModalPlugin> {
        self.plugins
            .get_mut(data_key)
            .ok_or_else(|| MultiModalError::UnknownModality(data_key.to_string()))
    }

    pub fn register_input_mapper(
        &mut self,
        data_key: &str,
        model: impl Into<ModelIdentity>,
        mapper: Option<InputMapper>,
    ) -> Result<ModelIdentity> {
        Ok(self.plugin_mut(data_key)?.register_input_mapper(model, mapper))
    }

    pub fn register_max_multimodal_tokens(
        &mut self,
        data_key: &str,
        model: impl Into<ModelIdentity>,
        max_mm_tokens: Option<MaxTokens>,
    ) -> Result<ModelIdentity> {
        self.plugin_mut(data_key)?
            .register_max_multimodal_tokens(model, max_mm_tokens)
    }

    pub fn register_image_input_mapper(
        &mut self,
        model: impl Into<ModelIdentity>,
        mapper: Option<InputMapper>,
    ) -> Result<ModelIdentity> {
        self.register_input_mapper(ImagePlugin::DATA_KEY, model, mapper)
    }

    pub fn register_video_input_mapper(
        &mut self,
        model: impl Into<ModelIdentity>,
        mapper: Option<InputMapper>,
    ) -> Result<ModelIdentity> {
        self.register_input_mapper(VideoPlugin::DATA_KEY, model, mapper)
    }

    pub fn register_audio_input_mapper(
        &mut self,
        model: impl Into<ModelIdentity>,
        mapper: Option<InputMapper>,
    ) -> Result<ModelIdentity> {
        self.register_input_mapper(AudioPlugin::DATA_KEY, model, mapper)
    }

    pub fn register_max_image_tokens(
        &mut self,
        model: impl Into<ModelIdentity>,
        max_mm_tokens: Option<MaxTokens>,
    ) -> Result<ModelIdentity> {
        self.register_max_multimodal_tokens(ImagePlugin::DATA_KEY, model, max_mm_tokens)
    }

    pub fn register_max_video_tokens(
        &mut self,
        model: impl Into<ModelIdentity>,
        max_mm_tokens: Option<MaxTokens>,
    ) -> Result<ModelIdentity> {
        self.register_max_multimodal_tokens(VideoPlugin::DATA_KEY, model, max_mm_tokens)
    }

    pub fn register_max_audio_tokens(
        &mut self,
        model: impl Into<ModelIdentity>,
        max_mm_tokens: Option<MaxTokens>,
    ) -> Result<ModelIdentity> {
        self.register_max_multimodal_tokens(AudioPlugin::DATA_KEY, model, max_mm_tokens)
    }

    /// Compute the maximum number of items per modality allowed in one prompt.
    ///
    /// Without `limit_mm_per_prompt` every modality allows one item, as does any modality missing
    /// from it. A limit map whose values are all zero (or which is empty) disables multi-modal
    /// input for the model, including plugins registered later.
    pub fn init_mm_limits_per_prompt(&mut self, model_config: &ModelConfig) {
        if self.limits_by_model.contains_key(&model_config.model) {
            warn!(
                "`limit_mm_per_prompt` has already been set for model `{}`, and will be overwritten by the new values.",
                model_config.model
            );
        }

        let limits = match &model_config.limit_mm_per_prompt {
            None => ItemLimits {
                per_modality: self.plugins.keys().map(|k| (k.clone(), 1)).collect(),
                fallback: 1,
            },
            Some(configured) if configured.values().all(|&n| n == 0) => ItemLimits {
                per_modality: self.plugins.keys().map(|k| (k.clone(), 0)).collect(),
                fallback: 0,
            },
            Some(configured) => {
                for key in configured.keys() {
                    if !self.plugins.contains_key(key) {
                        warn!("`limit_mm_per_prompt` is only supported for multimodal models. Ignoring unknown modality `{key}`.");
                    }
                }
                ItemLimits {
                    per_modality: self
                        .plugins
                        .keys()
                        .map(|k| (k.clone(), configured.get(k).copied().unwrap_or(1)))
                        .collect(),
                    fallback: 1,
                }
            }
        };
        info!(
            "Multi-modal limits per prompt for `{}`: {:?}",
            model_config.model, limits.per_modality
        );
        self.limits_by_model
            .insert(model_config.model.clone(), limits);
    }

    fn item_limits(&self, model_config: &ModelConfig) -> Result<&ItemLimits> {
        self.limits_by_model.get(&model_config.model).ok_or_else(|| {
            MultiModalError::InvalidConfiguration(format!(
                "Multi-modal limits per prompt have not been initialized for `{}`.",
                model_config.model
            ))
        })
    }

    /// Item limit of every registered modality for the model.
    pub fn get_mm_limits_per_prompt(
        &self,
        model_config: &ModelConfig,
    ) -> Result<IndexMap<String, usize>> {
        let limits = self.item_limits(model_config)?;
        Ok(self
            .plugins
            .keys()
            .map(|k| (k.clone(), limits.get(k)))
            .collect())
    }

    /// Map every modality of one request and merge the results into a single bundle.
    pub fn map_input(
        &self,
        model_config: &ModelConfig,
        data: &MultiModalDataDict,
        mm_processor_kwargs: &ProcessorKwargs,
    ) -> Result<MultiModalInputs> {
        let limits = self.item_limits(model_config)?;
        let mut merged = MultiModalInputs::new();

        for (data_key, data_value) in data {
            let plugin = self
                .plugins
                .get(data_key)
                .ok_or_else(|| MultiModalError::UnknownModality(data_key.clone()))?;

            let count = data_value.num_items();
            let limit = limits.get(data_key);
            if count > limit {
                return Err(MultiModalError::TooManyItems {
                    modality: data_key.clone(),
                    count,
                    limit,
                });
            }

            let mapped = plugin.map_input(model_config, data_value, mm_processor_kwargs)?;
            for (field, value) in mapped {
                if merged.contains_key(&field) {
                    return Err(MultiModalError::ConflictingField {
                        field,
                        modalities: data.keys().cloned().collect(),
                    });
                }
                merged.insert(field, value);
            }
        }

        Ok(merged)
    }

    /// Maximum tokens one item of each modality may occupy for the model.
    pub fn get_max_tokens_per_item_by_modality(
        &self,
        model_config: &ModelConfig,
    ) -> Result<IndexMap<String, usize>> {
        self.plugins
            .iter()
            .map(|(key, plugin)| Ok((key.clone(), plugin.get_max_multimodal_tokens(model_config)?)))
            .collect()
    }

    /// Upper bound on the multi-modal tokens of one prompt: the per-item budget of every
    /// modality times its item limit.
    pub fn get_max_multimodal_tokens(&self, model_config: &ModelConfig) -> Result<usize> {
        let limits = self.item_limits(model_config)?;
        let mut total = 0usize;
        for (key, per_item) in self.get_max_tokens_per_item_by_modality(model_config)? {
            total = limits
                .get(&key)
                .checked_mul(per_item)
                .and_then(|tokens| total.checked_add(tokens))
                .ok_or_else(|| {
                    MultiModalError::InvalidConfiguration(format!(
                        "The multi-modal token budget of `{}` overflows: `{key}` allows {} items of {per_item} tokens each.",
                        model_config.model,
                        limits.get(&key)
                    ))
                })?;
        }
        Ok(total)
    }
}
