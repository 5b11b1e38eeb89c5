//! Per-modality dispatch of input mappers and token budgets, keyed by model class.

use std::{collections::HashMap, fmt, sync::Arc};

use tracing::warn;

use crate::{
    architecture::{ArchitectureResolver, HfArchitectureResolver, ModelIdentity},
    config::{ModelConfig, ProcessorKwargs},
    context::InputContext,
    data::{MultiModalData, MultiModalDataExt},
    error::{MultiModalError, Result},
    inputs::MultiModalInputs,
    logging::once_log_info,
};

type MapperFn = dyn Fn(&InputContext<'_>, &MultiModalData, &ProcessorKwargs) -> Result<MultiModalInputs>
    + Send
    + Sync;
type TokensCalcFn = dyn Fn(&InputContext<'_>, &ProcessorKwargs) -> Result<i64> + Send + Sync;

/// The modality-specific half of a [`MultiModalPlugin`].
pub trait ModalityHandler: Send + Sync {
    /// Key of this modality in a request's data dictionary.
    fn data_key(&self) -> &str;

    /// Mapper used for models registered without a custom one.
    ///
    /// Fails with [`MultiModalError::UnsupportedModality`] if `data` is not of this modality.
    fn default_input_mapper(
        &self,
        ctx: &InputContext<'_>,
        data: &MultiModalData,
        kwargs: &ProcessorKwargs,
    ) -> Result<MultiModalInputs>;

    /// Token budget used for models registered without a custom one.
    fn default_max_multimodal_tokens(&self, ctx: &InputContext<'_>) -> Result<i64>;
}

/// A model-specific mapper from raw modality data to model keyword inputs.
///
/// Processor kwargs reach the mapper only if declared with [`InputMapper::with_kwargs`].
#[derive(Clone)]
pub struct InputMapper {
    f: Arc<MapperFn>,
    kwargs: Vec<String>,
}

impl InputMapper {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&InputContext<'_>, &MultiModalData, &ProcessorKwargs) -> Result<MultiModalInputs>
            + Send
            + Sync
            + 'static,
    {
        Self {
            f: Arc::new(f),
            kwargs: Vec::new(),
        }
    }

    pub fn with_kwargs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kwargs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn accepted_kwargs(&self) -> &[String] {
        &self.kwargs
    }
}

impl fmt::Debug for InputMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputMapper")
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}

/// Computes a token budget from the model config, e.g. from the vision tower's image size.
#[derive(Clone)]
pub struct TokensFn {
    f: Arc<TokensCalcFn>,
    kwargs: Vec<String>,
}

impl TokensFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&InputContext<'_>, &ProcessorKwargs) -> Result<i64> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            kwargs: Vec::new(),
        }
    }

    pub fn with_kwargs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kwargs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn accepted_kwargs(&self) -> &[String] {
        &self.kwargs
    }
}

impl fmt::Debug for TokensFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokensFn")
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}

/// Maximum number of language model tokens one item of a modality may occupy.
#[derive(Clone, Debug)]
pub enum MaxTokens {
    Fixed(i64),
    Computed(TokensFn),
}

impl From<i64> for MaxTokens {
    fn from(value: i64) -> Self {
        Self::Fixed(value)
    }
}

impl From<TokensFn> for MaxTokens {
    fn from(value: TokensFn) -> Self {
        Self::Computed(value)
    }
}

#[derive(Clone, Debug)]
enum MapperEntry {
    Default,
    Custom(InputMapper),
}

#[derive(Clone, Debug)]
enum TokensEntry {
    Default,
    Custom(MaxTokens),
}

fn validate_max_multimodal_tokens(max_mm_tokens: i64) -> Result<usize> {
    match usize::try_from(max_mm_tokens) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(MultiModalError::InvalidConfiguration(format!(
            "You should set the number of tokens to a positive integer. Found: {max_mm_tokens}"
        ))),
    }
}

/// Init-time kwargs restricted to `accepted`; the rest are dropped with a one-time notice.
fn allowed_init_kwargs(
    model_config: &ModelConfig,
    accepted: &[String],
    what: &str,
) -> ProcessorKwargs {
    let Some(init) = &model_config.mm_processor_kwargs else {
        return ProcessorKwargs::new();
    };
    let mut allowed = ProcessorKwargs::new();
    for (k, v) in init {
        if accepted.contains(k) {
            allowed.insert(k.clone(), v.clone());
        } else {
            once_log_info(format!(
                "Dropping processor kwarg `{k}`, which the {what} for `{}` does not accept.",
                model_config.model
            ));
        }
    }
    allowed
}

/// Dispatches one modality's data to the mapper and token budget registered for a model class.
///
/// Registration happens during startup through `&mut self`; lookups only need `&self`, so a
/// fully registered plugin can be shared across request threads.
pub struct MultiModalPlugin {
    handler: Box<dyn ModalityHandler>,
    resolver: Arc<dyn ArchitectureResolver>,
    input_mappers: HashMap<ModelIdentity, MapperEntry>,
    max_mm_tokens: HashMap<ModelIdentity, TokensEntry>,
}

impl MultiModalPlugin {
    pub fn new(handler: impl ModalityHandler + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            resolver: Arc::new(HfArchitectureResolver::new()),
            input_mappers: HashMap::new(),
            max_mm_tokens: HashMap::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ArchitectureResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn data_key(&self) -> &str {
        self.handler.data_key()
    }

    /// Register `mapper` for `model`, or the modality's default mapper if `None`.
    /// An existing registration is replaced.
    pub fn register_input_mapper(
        &mut self,
        model: impl Into<ModelIdentity>,
        mapper: Option<InputMapper>,
    ) -> ModelIdentity {
        let model = model.into();
        if self.input_mappers.contains_key(&model) {
            warn!("Model class {model} already has an input mapper registered to {self}. It is overwritten by the new one.");
        }
        let entry = match mapper {
            Some(mapper) => MapperEntry::Custom(mapper),
            None => MapperEntry::Default,
        };
        self.input_mappers.insert(model.clone(), entry);
        model
    }

    /// Register the token budget for `model`, or the modality's default if `None`.
    /// Fixed budgets are validated here.
    pub fn register_max_multimodal_tokens(
        &mut self,
        model: impl Into<ModelIdentity>,
        max_mm_tokens: Option<MaxTokens>,
    ) -> Result<ModelIdentity> {
        let model = model.into();
        if let Some(MaxTokens::Fixed(n)) = &max_mm_tokens {
            validate_max_multimodal_tokens(*n)?;
        }
        if self.max_mm_tokens.contains_key(&model) {
            warn!("Model class {model} already calculates maximum number of tokens in {self}. It is overwritten by the new one.");
        }
        let entry = match max_mm_tokens {
            Some(tokens) => TokensEntry::Custom(tokens),
            None => TokensEntry::Default,
        };
        self.max_mm_tokens.insert(model.clone(), entry);
        Ok(model)
    }

    pub fn has_input_mapper(&self, model: &ModelIdentity) -> bool {
        self.input_mappers.contains_key(model)
    }

    /// Turn `data` into the keyword inputs of the model described by `model_config`.
    ///
    /// `mm_processor_kwargs` take precedence over the model config's init-time kwargs. A
    /// custom mapper fails on any key it has not declared; the default mapper receives
    /// everything and leaves filtering to its processor.
    pub fn map_input(
        &self,
        model_config: &ModelConfig,
        data: &MultiModalData,
        mm_processor_kwargs: &ProcessorKwargs,
    ) -> Result<MultiModalInputs> {
        let model = self.resolver.resolve(model_config)?;
        let Some(entry) = self.input_mappers.get(&model) else {
            return Err(MultiModalError::UnregisteredMapper {
                plugin: self.to_string(),
                model,
            });
        };
        let ctx = InputContext::new(&model, model_config);

        let result = match entry {
            MapperEntry::Default => {
                let mut kwargs = model_config.mm_processor_kwargs.clone().unwrap_or_default();
                kwargs.extend(mm_processor_kwargs.clone());
                self.handler.default_input_mapper(&ctx, data, &kwargs)
            }
            MapperEntry::Custom(mapper) => {
                let unknown = mm_processor_kwargs
                    .keys()
                    .filter(|k| !mapper.kwargs.contains(k))
                    .cloned()
                    .collect::<Vec<_>>();
                if !unknown.is_empty() {
                    return Err(MultiModalError::UnknownProcessorKwargs {
                        model: model.clone(),
                        keys: unknown,
                    });
                }
                let mut kwargs = allowed_init_kwargs(model_config, &mapper.kwargs, "input mapper");
                kwargs.extend(mm_processor_kwargs.clone());
                (mapper.f)(&ctx, data, &kwargs)
            }
        };

        result.map_err(|e| match e {
            MultiModalError::Processor(e) => MultiModalError::unsupported(
                self.data_key(),
                data.describe(),
                e.to_string(),
            ),
            MultiModalError::Tensor(e) => MultiModalError::unsupported(
                self.data_key(),
                data.describe(),
                e.to_string(),
            ),
            e => e,
        })
    }

    /// Maximum number of tokens one item of this modality may occupy for the model.
    ///
    /// Models without an input mapper for this modality get 0.
    pub fn get_max_multimodal_tokens(&self, model_config: &ModelConfig) -> Result<usize> {
        let model = self.resolver.resolve(model_config)?;
        if !self.input_mappers.contains_key(&model) {
            return Ok(0);
        }
        let Some(entry) = self.max_mm_tokens.get(&model) else {
            return Err(MultiModalError::UnregisteredEstimator {
                plugin: self.to_string(),
                model,
            });
        };
        let ctx = InputContext::new(&model, model_config);

        let max_mm_tokens = match entry {
            TokensEntry::Default => self.handler.default_max_multimodal_tokens(&ctx)?,
            TokensEntry::Custom(MaxTokens::Fixed(n)) => *n,
            TokensEntry::Custom(MaxTokens::Computed(calc)) => {
                let kwargs = allowed_init_kwargs(model_config, &calc.kwargs, "token estimator");
                (calc.f)(&ctx, &kwargs)?
            }
        };
        validate_max_multimodal_tokens(max_mm_tokens)
    }
}

impl fmt::Display for MultiModalPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} plugin", self.data_key())
    }
}
