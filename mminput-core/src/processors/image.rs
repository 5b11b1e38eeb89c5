use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use image::{DynamicImage, GenericImageView};
use mminput_vision::{
    ApplyTransforms, ConvertRgb, ImageTransform, Normalize, Rescale, Resize, ToTensor, Transforms,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    preprocessor_config::{PreProcessorConfig, ToFilter},
    FormatProcessor, ProcessorLoader, ProcessorOutput,
};
use crate::{
    config::{ModelConfig, ProcessorKwargs},
    data::MultiModalItem,
    inputs::HostArray,
};

/// Per-call overrides understood by [`HfImageProcessor`].
#[derive(Deserialize, Default)]
struct ImageOverrides {
    do_convert_rgb: Option<bool>,
    do_resize: Option<bool>,
    do_rescale: Option<bool>,
    rescale_factor: Option<f64>,
    do_normalize: Option<bool>,
    image_mean: Option<[f64; 3]>,
    image_std: Option<[f64; 3]>,
}

const OVERRIDE_KEYS: &[&str] = &[
    "do_convert_rgb",
    "do_resize",
    "do_rescale",
    "rescale_factor",
    "do_normalize",
    "image_mean",
    "image_std",
];

impl ImageOverrides {
    fn from_kwargs(kwargs: &ProcessorKwargs) -> Result<Self> {
        let mut known = serde_json::Map::new();
        for (k, v) in kwargs {
            if OVERRIDE_KEYS.contains(&k.as_str()) {
                known.insert(k.clone(), v.clone());
            } else {
                debug!("Image processor ignores kwarg `{k}`.");
            }
        }
        Ok(serde_json::from_value(Value::Object(known))?)
    }
}

/// Resize, rescale and normalize images following an HF `preprocessor_config.json`.
pub struct HfImageProcessor {
    config: PreProcessorConfig,
    device: Device,
}

impl HfImageProcessor {
    #[allow(clippy::excessive_precision)]
    pub const DEFAULT_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
    #[allow(clippy::excessive_precision)]
    pub const DEFAULT_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

    pub fn new(config: PreProcessorConfig) -> Self {
        Self {
            config,
            device: Device::Cpu,
        }
    }

    pub fn config(&self) -> &PreProcessorConfig {
        &self.config
    }

    /// Output is (c, h, w).
    pub fn preprocess(&self, image: &DynamicImage, kwargs: &ProcessorKwargs) -> Result<Tensor> {
        let overrides = ImageOverrides::from_kwargs(kwargs)?;
        let config = &self.config;
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            anyhow::bail!("Image has zero size ({w}x{h}).");
        }

        let convert = overrides
            .do_convert_rgb
            .or(config.do_convert_rgb)
            .unwrap_or(true)
            .then_some(ConvertRgb);
        let resize = match overrides.do_resize.or(config.do_resize).unwrap_or(true) {
            true => config
                .target_size((w, h))
                .map(|(target_w, target_h)| -> Result<Resize> {
                    Ok(Resize {
                        target_w,
                        target_h,
                        filter: config.resampling.unwrap_or(3).to_filter()?,
                    })
                })
                .transpose()?,
            false => None,
        };
        let rescale = overrides
            .do_rescale
            .or(config.do_rescale)
            .unwrap_or(true)
            .then(|| Rescale {
                factor: overrides
                    .rescale_factor
                    .or(config.rescale_factor)
                    .unwrap_or(1. / 255.),
            });
        let normalize = overrides
            .do_normalize
            .or(config.do_normalize)
            .unwrap_or(true)
            .then(|| Normalize {
                mean: overrides
                    .image_mean
                    .or(config.image_mean)
                    .unwrap_or(Self::DEFAULT_MEAN)
                    .to_vec(),
                std: overrides
                    .image_std
                    .or(config.image_std)
                    .unwrap_or(Self::DEFAULT_STD)
                    .to_vec(),
            });

        let mut image_transforms: Vec<
            &dyn ImageTransform<Input = DynamicImage, Output = DynamicImage>,
        > = Vec::new();
        if let Some(convert) = &convert {
            image_transforms.push(convert);
        }
        if let Some(resize) = &resize {
            image_transforms.push(resize);
        }
        let mut inner_transforms: Vec<&dyn ImageTransform<Input = Tensor, Output = Tensor>> =
            Vec::new();
        if let Some(rescale) = &rescale {
            inner_transforms.push(rescale);
        }
        if let Some(normalize) = &normalize {
            inner_transforms.push(normalize);
        }

        Ok(image.apply(
            Transforms {
                image_transforms: &image_transforms,
                input: &ToTensor,
                inner_transforms: &inner_transforms,
            },
            &self.device,
        )?)
    }
}

impl FormatProcessor for HfImageProcessor {
    fn process(&self, item: &MultiModalItem, kwargs: &ProcessorKwargs) -> Result<ProcessorOutput> {
        let MultiModalItem::Image(image) = item else {
            anyhow::bail!("Expected an image, got {}.", item.type_name());
        };
        let (w, h) = image.dimensions();
        let pixel_values = self.preprocess(image, kwargs)?;
        let mut output = ProcessorOutput::new();
        output.insert("pixel_values".to_string(), pixel_values.into());
        output.insert(
            "image_sizes".to_string(),
            HostArray::i64(vec![i64::from(h), i64::from(w)], [2]).into(),
        );
        Ok(output)
    }
}

/// Loads [`HfImageProcessor`] from `<model>/preprocessor_config.json`, with the model's
/// `mm_processor_kwargs` merged over the file.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreProcessorConfigLoader;

impl ProcessorLoader for PreProcessorConfigLoader {
    fn load(&self, model_config: &ModelConfig) -> Result<Arc<dyn FormatProcessor>> {
        let path = model_config.model_dir().join("preprocessor_config.json");
        if !path.exists() {
            anyhow::bail!(
                "No image processor is available for `{}`: `{}` does not exist.",
                model_config.model,
                path.display()
            );
        }
        let config = PreProcessorConfig::load(&path, model_config.mm_processor_kwargs.as_ref())?;
        Ok(Arc::new(HfImageProcessor::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use image::{ColorType, DynamicImage, Rgb, RgbImage};
    use serde_json::json;

    use super::HfImageProcessor;
    use crate::{
        config::ProcessorKwargs,
        data::MultiModalItem,
        inputs::NestedTensors,
        processors::{preprocessor_config::PreProcessorConfig, FormatProcessor},
    };

    fn processor(size: u32) -> HfImageProcessor {
        HfImageProcessor::new(PreProcessorConfig {
            size: Some(HashMap::from([
                ("height".to_string(), size),
                ("width".to_string(), size),
            ])),
            ..Default::default()
        })
    }

    #[test]
    fn process_resizes_and_reports_size() {
        let image = MultiModalItem::Image(DynamicImage::new(10, 6, ColorType::Rgba8));
        let output = processor(4).process(&image, &ProcessorKwargs::new()).unwrap();
        let pixel_values = output["pixel_values"].as_tensor().unwrap();
        assert_eq!(pixel_values.dims(), &[3, 4, 4]);
        match &output["image_sizes"] {
            NestedTensors::Array(a) => assert_eq!(a.shape, vec![2]),
            other => panic!("unexpected image_sizes {other:?}"),
        }
    }

    #[test]
    fn kwargs_override_config() {
        let image =
            MultiModalItem::Image(DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([255; 3]))));
        let kwargs: ProcessorKwargs = [
            ("do_resize".to_string(), json!(false)),
            ("do_normalize".to_string(), json!(false)),
            ("not_a_real_kwarg".to_string(), json!(1)),
        ]
        .into();
        let output = processor(8).process(&image, &kwargs).unwrap();
        let pixel_values = output["pixel_values"].as_tensor().unwrap();
        assert_eq!(pixel_values.dims(), &[3, 3, 3]);
        let max = pixel_values
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((max - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_non_images() {
        let audio = MultiModalItem::Audio(crate::data::AudioInput {
            samples: vec![],
            sample_rate: 16000,
        });
        assert!(processor(4).process(&audio, &ProcessorKwargs::new()).is_err());
    }

    #[test]
    fn rejects_badly_typed_override() {
        let image = MultiModalItem::Image(DynamicImage::new(2, 2, ColorType::Rgb8));
        let kwargs: ProcessorKwargs = [("do_resize".to_string(), json!("yes"))].into();
        assert!(processor(4).process(&image, &kwargs).is_err());
    }
}
