use candle_core::{DType, Device, Result, Tensor};
use image::DynamicImage;

/// Output is (c, h, w) in `[0, 255]`. Images with an alpha channel keep it.
pub(crate) fn image_to_pixels(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let (data, channels) = if image.color().has_alpha() {
        (image.to_rgba8().into_raw(), 4)
    } else {
        (image.to_rgb8().into_raw(), 3)
    };
    Tensor::from_vec(data, (h, w, channels), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)
}
