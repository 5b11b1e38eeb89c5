use candle_core::Tensor;
use either::Either;
use image::{DynamicImage, ImageBuffer, Rgb, Rgba};
use indexmap::IndexMap;

/// Raw PCM audio and its sample rate.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioInput {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A decoded video as an ordered list of frames.
#[derive(Clone, Debug)]
pub struct VideoInput {
    pub frames: Vec<DynamicImage>,
}

impl VideoInput {
    pub fn new(frames: Vec<DynamicImage>) -> Self {
        Self { frames }
    }

    /// Decode a (num_frames, height, width, channels) `u8` buffer. Channels must be 3 (RGB) or
    /// 4 (RGBA).
    pub fn from_raw(
        data: Vec<u8>,
        (t, h, w, c): (usize, usize, usize, usize),
    ) -> anyhow::Result<Self> {
        if c != 3 && c != 4 {
            anyhow::bail!("Video frames must have 3 or 4 channels, got {c}.");
        }
        if h == 0 || w == 0 {
            anyhow::bail!("Video frames must be non-empty, got {h}x{w}.");
        }
        let frame_len = h * w * c;
        if data.len() != t * frame_len {
            anyhow::bail!(
                "Video buffer has {} bytes but shape ({t}, {h}, {w}, {c}) needs {}.",
                data.len(),
                t * frame_len
            );
        }
        let (w, h) = (u32::try_from(w)?, u32::try_from(h)?);
        let mut frames = Vec::with_capacity(t);
        for chunk in data.chunks_exact(frame_len) {
            let frame = if c == 3 {
                ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, chunk.to_vec())
                    .map(DynamicImage::ImageRgb8)
            } else {
                ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, chunk.to_vec())
                    .map(DynamicImage::ImageRgba8)
            };
            frames.push(frame.ok_or_else(|| anyhow::anyhow!("Could not decode video frame."))?);
        }
        Ok(Self { frames })
    }
}

/// One instance of multi-modal data.
#[derive(Clone, Debug)]
pub enum MultiModalItem {
    Image(DynamicImage),
    Audio(AudioInput),
    Video(VideoInput),
    /// Precomputed embeddings.
    Embeddings(Tensor),
}

impl MultiModalItem {
    /// Name of the realized payload type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Image(_) => "DynamicImage",
            Self::Audio(_) => "AudioInput",
            Self::Video(_) => "VideoInput",
            Self::Embeddings(_) => "Tensor",
        }
    }
}

/// Either a single item, or an ordered list of items for the same modality.
pub type MultiModalData = Either<MultiModalItem, Vec<MultiModalItem>>;

/// Per-request data keyed by modality (`"image"`, `"audio"`, `"video"`, ...).
pub type MultiModalDataDict = IndexMap<String, MultiModalData>;

pub trait MultiModalDataExt {
    /// The realized type, e.g. `DynamicImage` or `Vec<AudioInput>`.
    fn describe(&self) -> String;
    fn num_items(&self) -> usize;
    fn items(&self) -> &[MultiModalItem];
}

impl MultiModalDataExt for MultiModalData {
    fn describe(&self) -> String {
        match self {
            Either::Left(item) => item.type_name().to_string(),
            Either::Right(items) if items.is_empty() => "Vec<_> (empty)".to_string(),
            Either::Right(items) => {
                let mut names: Vec<&str> = Vec::new();
                for item in items {
                    if !names.contains(&item.type_name()) {
                        names.push(item.type_name());
                    }
                }
                format!("Vec<{}>", names.join(" | "))
            }
        }
    }

    fn num_items(&self) -> usize {
        self.items().len()
    }

    fn items(&self) -> &[MultiModalItem] {
        match self {
            Either::Left(item) => std::slice::from_ref(item),
            Either::Right(items) => items,
        }
    }
}

#[cfg(test)]
mod tests {
    use either::Either;
    use image::{ColorType, DynamicImage};

    use super::{AudioInput, MultiModalData, MultiModalDataExt, MultiModalItem, VideoInput};

    #[test]
    fn describe_single_and_lists() {
        let image = MultiModalItem::Image(DynamicImage::new(2, 2, ColorType::Rgb8));
        let audio = MultiModalItem::Audio(AudioInput {
            samples: vec![0.0; 4],
            sample_rate: 16000,
        });
        let single: MultiModalData = Either::Left(image.clone());
        assert_eq!(single.describe(), "DynamicImage");
        assert_eq!(single.num_items(), 1);

        let list: MultiModalData = Either::Right(vec![image.clone(), image.clone()]);
        assert_eq!(list.describe(), "Vec<DynamicImage>");
        assert_eq!(list.num_items(), 2);

        let mixed: MultiModalData = Either::Right(vec![image, audio]);
        assert_eq!(mixed.describe(), "Vec<DynamicImage | AudioInput>");

        let empty: MultiModalData = Either::Right(vec![]);
        assert_eq!(empty.num_items(), 0);
    }

    #[test]
    fn video_from_raw() {
        let video = VideoInput::from_raw(vec![7u8; 2 * 3 * 4 * 3], (2, 3, 4, 3)).unwrap();
        assert_eq!(video.frames.len(), 2);
        assert_eq!(video.frames[0].width(), 4);
        assert_eq!(video.frames[0].height(), 3);
    }

    #[test]
    fn video_from_raw_rejects_bad_buffers() {
        assert!(VideoInput::from_raw(vec![0u8; 10], (1, 2, 2, 3)).is_err());
        assert!(VideoInput::from_raw(vec![0u8; 8], (1, 2, 2, 2)).is_err());
    }
}
