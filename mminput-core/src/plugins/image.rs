use std::sync::Arc;

use crate::{
    config::ProcessorKwargs,
    context::InputContext,
    data::{MultiModalData, MultiModalItem},
    error::Result,
    inputs::MultiModalInputs,
    plugin::ModalityHandler,
    processors::{map_with_processor, PreProcessorConfigLoader, ProcessorCache, ProcessorLoader},
};

/// Images, preprocessed by the model's image processor.
///
/// A request may carry several images; their outputs are stacked when every image yields the
/// same shapes and kept as a list otherwise.
pub struct ImagePlugin {
    cache: ProcessorCache,
    loader: Arc<dyn ProcessorLoader>,
}

impl ImagePlugin {
    pub const DATA_KEY: &'static str = "image";
    pub const DEFAULT_MAX_MULTIMODAL_TOKENS: i64 = 3000;

    pub fn new() -> Self {
        Self::with_loader(Arc::new(PreProcessorConfigLoader))
    }

    pub fn with_loader(loader: Arc<dyn ProcessorLoader>) -> Self {
        Self {
            cache: ProcessorCache::new(),
            loader,
        }
    }

    pub fn processor_cache(&self) -> &ProcessorCache {
        &self.cache
    }
}

impl Default for ImagePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ModalityHandler for ImagePlugin {
    fn data_key(&self) -> &str {
        Self::DATA_KEY
    }

    fn default_input_mapper(
        &self,
        ctx: &InputContext<'_>,
        data: &MultiModalData,
        kwargs: &ProcessorKwargs,
    ) -> Result<MultiModalInputs> {
        map_with_processor(
            Self::DATA_KEY,
            |item| matches!(item, MultiModalItem::Image(_)),
            &self.cache,
            self.loader.as_ref(),
            ctx.model_config(),
            data,
            kwargs,
        )
    }

    fn default_max_multimodal_tokens(&self, _: &InputContext<'_>) -> Result<i64> {
        Ok(Self::DEFAULT_MAX_MULTIMODAL_TOKENS)
    }
}

#[cfg(test)]
mod tests {
    use either::Either;
    use image::{ColorType, DynamicImage};
    use serde_json::json;

    use super::ImagePlugin;
    use crate::{
        architecture::ModelIdentity,
        config::{ModelConfig, ProcessorKwargs},
        context::InputContext,
        data::{AudioInput, MultiModalItem},
        error::MultiModalError,
        inputs::NestedTensors,
        plugin::{ModalityHandler, MultiModalPlugin},
    };

    const ARCH: &str = "LlavaForConditionalGeneration";

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("preprocessor_config.json"),
            json!({
                "do_resize": true,
                "size": {"height": 8, "width": 8},
                "resample": 3,
                "image_processor_type": "CLIPImageProcessor"
            })
            .to_string(),
        )
        .unwrap();
        dir
    }

    fn plugin() -> MultiModalPlugin {
        let mut plugin = MultiModalPlugin::new(ImagePlugin::new());
        plugin.register_input_mapper(ARCH, None);
        plugin
    }

    fn image(w: u32, h: u32) -> MultiModalItem {
        MultiModalItem::Image(DynamicImage::new(w, h, ColorType::Rgb8))
    }

    #[test]
    fn single_image() {
        let dir = model_dir();
        let config = ModelConfig::new(dir.path().to_string_lossy()).with_architectures([ARCH]);
        let inputs = plugin()
            .map_input(&config, &Either::Left(image(16, 12)), &ProcessorKwargs::new())
            .unwrap();
        assert_eq!(
            inputs["pixel_values"].as_tensor().unwrap().dims(),
            &[3, 8, 8]
        );
        assert!(matches!(inputs["image_sizes"], NestedTensors::Array(_)));
    }

    #[test]
    fn several_images_stack_or_list() {
        let dir = model_dir();
        let config = ModelConfig::new(dir.path().to_string_lossy()).with_architectures([ARCH]);
        let plugin = plugin();

        let same = Either::Right(vec![image(16, 12), image(4, 4)]);
        let inputs = plugin
            .map_input(&config, &same, &ProcessorKwargs::new())
            .unwrap();
        assert_eq!(
            inputs["pixel_values"].as_tensor().unwrap().dims(),
            &[2, 3, 8, 8]
        );
        assert_eq!(inputs["image_sizes"].as_tensor().unwrap().dims(), &[2, 2]);

        // Without resizing each image keeps its own size.
        let kwargs: ProcessorKwargs = [("do_resize".to_string(), json!(false))].into();
        let inputs = plugin.map_input(&config, &same, &kwargs).unwrap();
        let items = inputs["pixel_values"].as_list().unwrap();
        assert_eq!(items[0].as_tensor().unwrap().dims(), &[3, 12, 16]);
        assert_eq!(items[1].as_tensor().unwrap().dims(), &[3, 4, 4]);
    }

    #[test]
    fn processor_is_cached() {
        let dir = model_dir();
        let config = ModelConfig::new(dir.path().to_string_lossy()).with_architectures([ARCH]);
        let handler = ImagePlugin::new();
        let model = ModelIdentity::new(ARCH);
        let ctx = InputContext::new(&model, &config);
        for _ in 0..2 {
            handler
                .default_input_mapper(&ctx, &Either::Left(image(2, 2)), &ProcessorKwargs::new())
                .unwrap();
        }
        assert_eq!(handler.processor_cache().len(), 1);
    }

    #[test]
    fn rejects_other_payloads() {
        let dir = model_dir();
        let config = ModelConfig::new(dir.path().to_string_lossy()).with_architectures([ARCH]);
        let audio = MultiModalItem::Audio(AudioInput {
            samples: vec![0.0],
            sample_rate: 8000,
        });
        let err = plugin()
            .map_input(&config, &Either::Left(audio), &ProcessorKwargs::new())
            .unwrap_err();
        assert!(matches!(err, MultiModalError::UnsupportedModality { .. }));
        assert!(err.to_string().contains("AudioInput"));

        let err = plugin()
            .map_input(&config, &Either::Right(vec![]), &ProcessorKwargs::new())
            .unwrap_err();
        assert!(matches!(err, MultiModalError::UnsupportedModality { .. }));
    }

    #[test]
    fn missing_processor_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig::new(dir.path().to_string_lossy()).with_architectures([ARCH]);
        let err = plugin()
            .map_input(&config, &Either::Left(image(2, 2)), &ProcessorKwargs::new())
            .unwrap_err();
        assert!(matches!(err, MultiModalError::InvalidConfiguration(_)));
    }

    #[test]
    fn default_token_budget() {
        let mut plugin = plugin();
        plugin.register_max_multimodal_tokens(ARCH, None).unwrap();
        let config = ModelConfig::new("llava").with_architectures([ARCH]);
        assert_eq!(plugin.get_max_multimodal_tokens(&config).unwrap(), 3000);
    }
}
