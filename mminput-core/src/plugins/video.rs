use std::sync::Arc;

use crate::{
    config::ProcessorKwargs,
    context::InputContext,
    data::{MultiModalData, MultiModalItem},
    error::Result,
    inputs::MultiModalInputs,
    plugin::ModalityHandler,
    processors::{map_with_processor, ProcessorCache, ProcessorLoader, VideoProcessorLoader},
};

/// Videos, preprocessed frame by frame by the model's video processor.
pub struct VideoPlugin {
    cache: ProcessorCache,
    loader: Arc<dyn ProcessorLoader>,
}

impl VideoPlugin {
    pub const DATA_KEY: &'static str = "video";
    pub const DEFAULT_MAX_MULTIMODAL_TOKENS: i64 = 4096;

    pub fn new() -> Self {
        Self::with_loader(Arc::new(VideoProcessorLoader))
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

impl Default for VideoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ModalityHandler for VideoPlugin {
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
            |item| matches!(item, MultiModalItem::Video(_)),
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
