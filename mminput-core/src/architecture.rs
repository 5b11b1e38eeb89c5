use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    config::ModelConfig,
    error::{MultiModalError, Result},
};

/// Identifies a model class (not a loaded model). Input mappers and token estimators are
/// registered against it; every request for the same loaded model resolves to the same identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelIdentity(Arc<str>);

impl ModelIdentity {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ModelIdentity {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Turns a model configuration into the dispatch key used by the plugins.
pub trait ArchitectureResolver: Send + Sync {
    fn resolve(&self, model_config: &ModelConfig) -> Result<ModelIdentity>;
}

/// Resolves the first architecture listed in the model's `config.json`.
///
/// Several checkpoint architecture names may share one model implementation; aliases fold them
/// onto a single identity so they share registrations.
#[derive(Clone, Debug, Default)]
pub struct HfArchitectureResolver {
    aliases: HashMap<String, ModelIdentity>,
}

impl HfArchitectureResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alias(mut self, architecture: impl Into<String>, target: impl AsRef<str>) -> Self {
        self.aliases
            .insert(architecture.into(), ModelIdentity::new(target));
        self
    }
}

impl ArchitectureResolver for HfArchitectureResolver {
    fn resolve(&self, model_config: &ModelConfig) -> Result<ModelIdentity> {
        let arch = model_config.architectures.first().ok_or_else(|| {
            MultiModalError::UnresolvedArchitecture {
                model: model_config.model.clone(),
            }
        })?;
        Ok(self
            .aliases
            .get(arch)
            .cloned()
            .unwrap_or_else(|| ModelIdentity::new(arch)))
    }
}

#[cfg(test)]
mod tests {
    use super::{ArchitectureResolver, HfArchitectureResolver, ModelIdentity};
    use crate::{config::ModelConfig, error::MultiModalError};

    #[test]
    fn resolves_first_architecture() {
        let config = ModelConfig::new("llava-hf/llava-1.5-7b-hf").with_architectures([
            "LlavaForConditionalGeneration",
            "LlamaForCausalLM",
        ]);
        let id = HfArchitectureResolver::new().resolve(&config).unwrap();
        assert_eq!(id, ModelIdentity::new("LlavaForConditionalGeneration"));
    }

    #[test]
    fn aliases_share_identity() {
        let resolver = HfArchitectureResolver::new()
            .with_alias("MantisForConditionalGeneration", "LlavaForConditionalGeneration");
        let mantis =
            ModelConfig::new("mantis").with_architectures(["MantisForConditionalGeneration"]);
        let llava = ModelConfig::new("llava").with_architectures(["LlavaForConditionalGeneration"]);
        assert_eq!(
            resolver.resolve(&mantis).unwrap(),
            resolver.resolve(&llava).unwrap()
        );
    }

    #[test]
    fn empty_architectures_fail() {
        let err = HfArchitectureResolver::new()
            .resolve(&ModelConfig::new("no-arch"))
            .unwrap_err();
        assert!(matches!(err, MultiModalError::UnresolvedArchitecture { .. }));
    }
}
