use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use image::imageops::FilterType;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ProcessorKwargs;

/// `preprocessor_config.json` as shipped with HF vision checkpoints.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PreProcessorConfig {
    pub do_convert_rgb: Option<bool>,
    pub do_normalize: Option<bool>,
    pub do_rescale: Option<bool>,
    pub do_resize: Option<bool>,
    pub image_mean: Option<[f64; 3]>,
    pub image_std: Option<[f64; 3]>,
    pub rescale_factor: Option<f64>,
    #[serde(alias = "resample")]
    pub resampling: Option<usize>,
    pub size: Option<HashMap<String, u32>>,
}

impl PreProcessorConfig {
    /// Read the config at `path`, with `overrides` taking precedence over the file's keys.
    pub fn load(path: &Path, overrides: Option<&ProcessorKwargs>) -> Result<Self> {
        let mut value: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        if let (Some(obj), Some(overrides)) = (value.as_object_mut(), overrides) {
            for (k, v) in overrides {
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Output (width, height) for an image of size `(w, h)`, or `None` if `size` is unset.
    ///
    /// `height`/`width` give an exact size; `shortest_edge` and `longest_edge` scale the
    /// corresponding side and preserve the aspect ratio.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn target_size(&self, (w, h): (u32, u32)) -> Option<(u32, u32)> {
        let size = self.size.as_ref()?;
        if let (Some(&tw), Some(&th)) = (size.get("width"), size.get("height")) {
            return Some((tw, th));
        }
        let scale_to = |edge: u32, side: u32| edge as f64 / side as f64;
        let scale = if let Some(&edge) = size.get("shortest_edge") {
            scale_to(edge, w.min(h))
        } else if let Some(&edge) = size.get("longest_edge") {
            scale_to(edge, w.max(h))
        } else {
            return None;
        };
        let tw = ((w as f64 * scale).round() as u32).max(1);
        let th = ((h as f64 * scale).round() as u32).max(1);
        Some((tw, th))
    }
}

pub(crate) trait ToFilter {
    fn to_filter(self) -> Result<FilterType>;
}

impl ToFilter for usize {
    // https://github.com/python-pillow/Pillow/blob/4b68563e8a818fb9c528fa159ddf3f4eaefa35e6/src/PIL/Image.py#L164-L170
    fn to_filter(self) -> Result<FilterType> {
        match self {
            0 => Ok(FilterType::Nearest),
            1 => Ok(FilterType::Lanczos3),
            2 => Ok(FilterType::Triangle),   // BiLinear
            3 => Ok(FilterType::CatmullRom), // BiCubic
            4 => Ok(FilterType::Nearest),
            x => anyhow::bail!("Filter number {x} not supported"),
        }
    }
}
