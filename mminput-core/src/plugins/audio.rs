use crate::{
    config::ProcessorKwargs,
    context::InputContext,
    data::MultiModalData,
    error::{MultiModalError, Result},
    inputs::MultiModalInputs,
    plugin::ModalityHandler,
};

/// Audio has no model-independent preprocessing; every audio model registers its own mapper
/// and token budget.
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioPlugin;

impl AudioPlugin {
    pub const DATA_KEY: &'static str = "audio";
}

impl ModalityHandler for AudioPlugin {
    fn data_key(&self) -> &str {
        Self::DATA_KEY
    }

    fn default_input_mapper(
        &self,
        _: &InputContext<'_>,
        _: &MultiModalData,
        _: &ProcessorKwargs,
    ) -> Result<MultiModalInputs> {
        Err(MultiModalError::MissingDefault {
            modality: Self::DATA_KEY,
            what: "input mapper",
        })
    }

    fn default_max_multimodal_tokens(&self, _: &InputContext<'_>) -> Result<i64> {
        Err(MultiModalError::MissingDefault {
            modality: Self::DATA_KEY,
            what: "maximum number of multi-modal tokens",
        })
    }
}

#[cfg(test)]
mod tests {
    use either::Either;

    use super::AudioPlugin;
    use crate::{
        config::{ModelConfig, ProcessorKwargs},
        data::{AudioInput, MultiModalItem},
        error::MultiModalError,
        plugin::MultiModalPlugin,
    };

    #[test]
    fn defaults_are_missing() {
        let mut plugin = MultiModalPlugin::new(AudioPlugin);
        plugin.register_input_mapper("WhisperForConditionalGeneration", None);
        plugin
            .register_max_multimodal_tokens("WhisperForConditionalGeneration", None)
            .unwrap();
        let config = ModelConfig::new("whisper").with_architectures(["WhisperForConditionalGeneration"]);

        let data = Either::Left(MultiModalItem::Audio(AudioInput {
            samples: vec![0.0; 16],
            sample_rate: 16000,
        }));
        let err = plugin
            .map_input(&config, &data, &ProcessorKwargs::new())
            .unwrap_err();
        assert!(matches!(err, MultiModalError::MissingDefault { .. }));
        let err = plugin.get_max_multimodal_tokens(&config).unwrap_err();
        assert!(matches!(err, MultiModalError::MissingDefault { .. }));
    }
}
