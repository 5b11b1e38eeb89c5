use std::sync::Arc;

use anyhow::Result;
use candle_core::Tensor;
use image::GenericImageView;
use tracing::debug;

use super::{
    preprocessor_config::PreProcessorConfig, FormatProcessor, HfImageProcessor, ProcessorLoader,
    ProcessorOutput,
};
use crate::{
    config::{ModelConfig, ProcessorKwargs},
    data::MultiModalItem,
    inputs::HostArray,
};

/// Runs the image pipeline over every frame of a video.
pub struct HfVideoProcessor {
    frames: HfImageProcessor,
}

impl HfVideoProcessor {
    pub fn new(config: PreProcessorConfig) -> Self {
        Self {
            frames: HfImageProcessor::new(config),
        }
    }
}

impl FormatProcessor for HfVideoProcessor {
    fn process(&self, item: &MultiModalItem, kwargs: &ProcessorKwargs) -> Result<ProcessorOutput> {
        let MultiModalItem::Video(video) = item else {
            anyhow::bail!("Expected a video, got {}.", item.type_name());
        };
        let Some(first) = video.frames.first() else {
            anyhow::bail!("Video has no frames.");
        };
        let (w, h) = first.dimensions();
        if video.frames.iter().any(|f| f.dimensions() != (w, h)) {
            anyhow::bail!("All video frames must have the same size.");
        }

        let frames = video
            .frames
            .iter()
            .map(|frame| self.frames.preprocess(frame, kwargs))
            .collect::<Result<Vec<_>>>()?;
        // (t, c, h, w)
        let pixel_values_videos = Tensor::stack(&frames, 0)?;

        let t = i64::try_from(frames.len())?;
        let mut output = ProcessorOutput::new();
        output.insert(
            "pixel_values_videos".to_string(),
            pixel_values_videos.into(),
        );
        output.insert(
            "video_sizes".to_string(),
            HostArray::i64(vec![t, i64::from(h), i64::from(w)], [3]).into(),
        );
        Ok(output)
    }
}

/// Loads [`HfVideoProcessor`] from `video_preprocessor_config.json`, falling back to
/// `preprocessor_config.json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct VideoProcessorLoader;

impl ProcessorLoader for VideoProcessorLoader {
    fn load(&self, model_config: &ModelConfig) -> Result<Arc<dyn FormatProcessor>> {
        let dir = model_config.model_dir();
        let path = ["video_preprocessor_config.json", "preprocessor_config.json"]
            .into_iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No video processor is available for `{}`: `{}` has no preprocessor config.",
                    model_config.model,
                    dir.display()
                )
            })?;
        debug!("Loading video processor config from `{}`.", path.display());
        let config = PreProcessorConfig::load(&path, model_config.mm_processor_kwargs.as_ref())?;
        Ok(Arc::new(HfVideoProcessor::new(config)))
    }
}
