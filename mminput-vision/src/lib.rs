use candle_core::{Device, Result, Tensor};
use image::DynamicImage;

mod transforms;
pub(crate) mod utils;

pub use transforms::{ConvertRgb, Normalize, Rescale, Resize, ToTensor};

/// A single preprocessing step, either on the decoded image or on its tensor form.
pub trait ImageTransform {
    type Input;
    type Output;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output>;
}

/// An ordered preprocessing pipeline.
///
/// `image_transforms` run on the `DynamicImage`, `input` turns the result into a tensor and
/// `inner_transforms` run on that tensor.
pub struct Transforms<'a> {
    pub image_transforms: &'a [&'a dyn ImageTransform<Input = DynamicImage, Output = DynamicImage>],
    pub input: &'a dyn ImageTransform<Input = DynamicImage, Output = Tensor>,
    pub inner_transforms: &'a [&'a dyn ImageTransform<Input = Tensor, Output = Tensor>],
}

pub trait ApplyTransforms<'a> {
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor>;
}

impl<'a> ApplyTransforms<'a> for DynamicImage {
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor> {
        let mut image = None;
        for transform in transforms.image_transforms {
            image = Some(transform.map(image.as_ref().unwrap_or(self), device)?);
        }
        let mut res = transforms
            .input
            .map(image.as_ref().unwrap_or(self), device)?;
        for transform in transforms.inner_transforms {
            res = transform.map(&res, device)?;
        }
        Ok(res)
    }
}
