//! Format-specific processors turning raw payloads into model inputs, and the cache that keeps
//! one loaded processor per model configuration.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::Ordering, Arc, Mutex, MutexGuard, PoisonError},
};

use either::Either;
use indexmap::IndexMap;
use tracing::{error, info};

use crate::{
    config::{ModelConfig, ProcessorKwargs},
    data::{MultiModalData, MultiModalDataExt, MultiModalItem},
    error::{MultiModalError, Result},
    inputs::{MultiModalInputs, NestedTensors},
    DEBUG,
};

mod image;
pub mod preprocessor_config;
mod video;

pub use self::image::{HfImageProcessor, PreProcessorConfigLoader};
pub use self::video::{HfVideoProcessor, VideoProcessorLoader};

pub type ProcessorOutput = IndexMap<String, NestedTensors>;

/// Converts one raw item into named arrays. Keys it does not understand in `kwargs` are ignored.
pub trait FormatProcessor: Send + Sync {
    fn process(
        &self,
        item: &MultiModalItem,
        kwargs: &ProcessorKwargs,
    ) -> anyhow::Result<ProcessorOutput>;
}

/// Builds the processor for a model, e.g. from its `preprocessor_config.json`.
pub trait ProcessorLoader: Send + Sync {
    fn load(&self, model_config: &ModelConfig) -> anyhow::Result<Arc<dyn FormatProcessor>>;
}

/// Cache key: everything that can change what the loader builds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProcessorKey {
    pub model: String,
    pub trust_remote_code: bool,
    /// `mm_processor_kwargs` as canonical (key-sorted) JSON.
    pub kwargs: String,
}

impl ProcessorKey {
    pub fn from_config(model_config: &ModelConfig) -> Self {
        let kwargs = model_config
            .mm_processor_kwargs
            .as_ref()
            .map(|kwargs| {
                let sorted: BTreeMap<_, _> = kwargs.iter().collect();
                serde_json::to_string(&sorted).unwrap_or_default()
            })
            .unwrap_or_default();
        Self {
            model: model_config.model.clone(),
            trust_remote_code: model_config.trust_remote_code,
            kwargs,
        }
    }
}

/// Process-lifetime memoizing cache of loaded processors. Entries are never evicted.
#[derive(Default)]
pub struct ProcessorCache {
    entries: Mutex<HashMap<ProcessorKey, Arc<dyn FormatProcessor>>>,
}

impl ProcessorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &self,
        model_config: &ModelConfig,
        loader: &dyn ProcessorLoader,
    ) -> anyhow::Result<Arc<dyn FormatProcessor>> {
        let key = ProcessorKey::from_config(model_config);
        if let Some(processor) = self.lock().get(&key) {
            return Ok(processor.clone());
        }

        // Loading reads from disk, so it runs unlocked. If two callers race on the same key the
        // first insert wins and both get that processor.
        info!("Loading multi-modal processor for `{}`.", key.model);
        let processor = loader.load(model_config)?;
        Ok(self.lock().entry(key).or_insert(processor).clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessorKey, Arc<dyn FormatProcessor>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared body of the built-in mappers: check every item is what `modality` expects, run each
/// through the cached processor and merge the per-item outputs field-wise.
pub(crate) fn map_with_processor(
    modality: &'static str,
    expected: fn(&MultiModalItem) -> bool,
    cache: &ProcessorCache,
    loader: &dyn ProcessorLoader,
    model_config: &ModelConfig,
    data: &MultiModalData,
    kwargs: &ProcessorKwargs,
) -> Result<MultiModalInputs> {
    let items = data.items();
    if items.is_empty() {
        return Err(MultiModalError::unsupported(
            modality,
            data.describe(),
            "expected at least one item",
        ));
    }
    if !items.iter().all(expected) {
        return Err(MultiModalError::unsupported(
            modality,
            data.describe(),
            format!("invalid {modality} type"),
        ));
    }

    let processor = cache
        .get_or_load(model_config, loader)
        .map_err(|e| MultiModalError::InvalidConfiguration(format!("{e:#}")))?;
    let process = |item: &MultiModalItem| -> Result<MultiModalInputs> {
        processor
            .process(item, kwargs)
            .map(MultiModalInputs::from)
            .map_err(|e| {
                if DEBUG.load(Ordering::Relaxed) {
                    error!("Failed to process {modality} ({}): {e:?}", item.type_name());
                } else {
                    error!("Failed to process {modality} ({}): {e}", item.type_name());
                }
                MultiModalError::unsupported(modality, item.type_name(), e.to_string())
            })
    };

    match data {
        Either::Left(item) => process(item),
        Either::Right(items) => {
            let per_item = items.iter().map(process).collect::<Result<Vec<_>>>()?;
            Ok(MultiModalInputs::batch(per_item)?.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use indexmap::IndexMap;
    use serde_json::json;

    use super::{FormatProcessor, ProcessorCache, ProcessorKey, ProcessorLoader, ProcessorOutput};
    use crate::{
        config::{ModelConfig, ProcessorKwargs},
        data::MultiModalItem,
    };

    struct NullProcessor;

    impl FormatProcessor for NullProcessor {
        fn process(
            &self,
            _: &MultiModalItem,
            _: &ProcessorKwargs,
        ) -> anyhow::Result<ProcessorOutput> {
            Ok(IndexMap::new())
        }
    }

    #[derive(Default)]
    struct CountingLoader(AtomicUsize);

    impl ProcessorLoader for CountingLoader {
        fn load(&self, _: &ModelConfig) -> anyhow::Result<Arc<dyn FormatProcessor>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullProcessor))
        }
    }

    #[test]
    fn cache_loads_once_per_key() {
        let cache = ProcessorCache::new();
        let loader = CountingLoader::default();
        let config = ModelConfig::new("model-a");
        cache.get_or_load(&config, &loader).unwrap();
        cache.get_or_load(&config, &loader).unwrap();
        assert_eq!(loader.0.load(Ordering::SeqCst), 1);

        let trusted = ModelConfig::new("model-a").with_trust_remote_code(true);
        cache.get_or_load(&trusted, &loader).unwrap();
        let with_kwargs = ModelConfig::new("model-a")
            .with_mm_processor_kwargs([("num_crops".to_string(), json!(4))].into());
        cache.get_or_load(&with_kwargs, &loader).unwrap();
        assert_eq!(loader.0.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 3);
    }

    /// Loads its processor through the same cache, as a processor built on a shared one would.
    struct NestedLoader<'a> {
        cache: &'a ProcessorCache,
        inner: CountingLoader,
    }

    impl ProcessorLoader for NestedLoader<'_> {
        fn load(&self, _: &ModelConfig) -> anyhow::Result<Arc<dyn FormatProcessor>> {
            self.cache
                .get_or_load(&ModelConfig::new("shared-base"), &self.inner)
        }
    }

    #[test]
    fn load_runs_without_holding_the_cache() {
        let cache = ProcessorCache::new();
        let loader = NestedLoader {
            cache: &cache,
            inner: CountingLoader::default(),
        };
        let first = cache
            .get_or_load(&ModelConfig::new("model-a"), &loader)
            .unwrap();
        let second = cache
            .get_or_load(&ModelConfig::new("model-a"), &loader)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.inner.0.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_loads_share_one_entry() {
        let cache = ProcessorCache::new();
        let loader = CountingLoader::default();
        let config = ModelConfig::new("model-a");
        let loaded = std::thread::scope(|s| {
            let handles = (0..4)
                .map(|_| s.spawn(|| cache.get_or_load(&config, &loader).unwrap()))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(cache.len(), 1);
        let cached = cache.get_or_load(&config, &loader).unwrap();
        assert!(loaded.iter().all(|p| Arc::ptr_eq(p, &cached)));
    }

    #[test]
    fn key_ignores_kwarg_order() {
        let a = ModelConfig::new("m").with_mm_processor_kwargs(
            [("a".to_string(), json!(1)), ("b".to_string(), json!(2))].into(),
        );
        let b = ModelConfig::new("m").with_mm_processor_kwargs(
            [("b".to_string(), json!(2)), ("a".to_string(), json!(1))].into(),
        );
        assert_eq!(ProcessorKey::from_config(&a), ProcessorKey::from_config(&b));
    }
}
