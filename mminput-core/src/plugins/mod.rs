//! Built-in modality handlers.

mod audio;
mod image;
mod video;

pub use self::audio::AudioPlugin;
pub use self::image::ImagePlugin;
pub use self::video::VideoPlugin;
