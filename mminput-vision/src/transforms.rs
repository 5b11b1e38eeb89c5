use crate::utils::image_to_pixels;
use candle_core::{Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage};

use crate::ImageTransform;

/// Convert an image to a tensor of shape (channels, height, width).
/// Values stay in `[0, 255]`; use [`Rescale`] to bring them into `[0.0, 1.0]`.
pub struct ToTensor;

impl ImageTransform for ToTensor {
    type Input = DynamicImage;
    type Output = Tensor;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        image_to_pixels(x, device)
    }
}

/// Drop any alpha channel and expand grayscale images to three channels.
pub struct ConvertRgb;

impl ImageTransform for ConvertRgb {
    type Input = DynamicImage;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        Ok(DynamicImage::ImageRgb8(x.to_rgb8()))
    }
}

/// Resize the image to exactly `target_w` x `target_h`.
pub struct Resize {
    pub target_w: u32,
    pub target_h: u32,
    pub filter: FilterType,
}

impl ImageTransform for Resize {
    type Input = DynamicImage;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        if self.target_w == 0 || self.target_h == 0 {
            candle_core::bail!(
                "Cannot resize to {}x{}, both sides must be non-zero.",
                self.target_w,
                self.target_h
            );
        }
        Ok(x.resize_exact(self.target_w, self.target_h, self.filter))
    }
}

/// Multiply every value by `factor`, typically `1/255`.
pub struct Rescale {
    pub factor: f64,
}

impl ImageTransform for Rescale {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        x.affine(self.factor, 0.)
    }
}

/// Normalize the image data based on the mean and standard deviation.
/// The value is computed as follows:
/// `
/// x[channel]=(x[channel] - mean[channel]) / std[channel]
/// `
///
/// Expects an input tensor of shape (channels, height, width).
pub struct Normalize {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ImageTransform for Normalize {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        let num_channels = x.dim(0)?;
        if self.mean.len() != num_channels || self.std.len() != num_channels {
            candle_core::bail!(
                "Num channels ({num_channels}) must match number of mean ({}) and std ({}).",
                self.mean.len(),
                self.std.len()
            );
        }
        let mean = Tensor::from_slice(self.mean.as_slice(), (num_channels, 1, 1), x.device())?
            .to_dtype(x.dtype())?;
        let std = Tensor::from_slice(self.std.as_slice(), (num_channels, 1, 1), x.device())?
            .to_dtype(x.dtype())?;
        x.broadcast_sub(&mean)?.broadcast_div(&std)
    }
}
