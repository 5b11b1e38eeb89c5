#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
//! Multi-modal input mapping and batching.
//!
//! Each modality (image, audio, video, ...) is served by a [`MultiModalPlugin`] that maps raw
//! request data to model keyword inputs with the mapper registered for the model class, and
//! reports how many tokens one item may occupy. [`MultiModalInputs::batch`] merges the inputs
//! of several requests, stacking tensors whose shapes agree.

use std::sync::atomic::AtomicBool;

mod architecture;
mod config;
mod context;
mod data;
mod error;
mod inputs;
mod logging;
mod plugin;
mod plugins;
pub mod processors;
mod registry;

pub use architecture::{ArchitectureResolver, HfArchitectureResolver, ModelIdentity};
pub use config::{ModelConfig, ProcessorKwargs};
pub use context::InputContext;
pub use data::{
    AudioInput, MultiModalData, MultiModalDataDict, MultiModalDataExt, MultiModalItem, VideoInput,
};
pub use error::{MultiModalError, Result};
pub use inputs::{ArrayData, BatchedTensorInputs, HostArray, MultiModalInputs, NestedTensors, Scalar};
pub use logging::{initialize_logging, once_log_info};
pub use plugin::{InputMapper, MaxTokens, ModalityHandler, MultiModalPlugin, TokensFn};
pub use plugins::{AudioPlugin, ImagePlugin, VideoPlugin};
pub use registry::MultiModalRegistry;

/// `true` if `MMINPUT_DEBUG=1`
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
