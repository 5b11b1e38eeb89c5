use crate::{architecture::ModelIdentity, config::ModelConfig};

/// Read-only view of the model handed to input mappers and token estimators.
#[derive(Clone, Copy, Debug)]
pub struct InputContext<'a> {
    model_identity: &'a ModelIdentity,
    model_config: &'a ModelConfig,
}

impl<'a> InputContext<'a> {
    pub fn new(model_identity: &'a ModelIdentity, model_config: &'a ModelConfig) -> Self {
        Self {
            model_identity,
            model_config,
        }
    }

    pub fn model_identity_and_config(&self) -> (&'a ModelIdentity, &'a ModelConfig) {
        (self.model_identity, self.model_config)
    }

    pub fn model_identity(&self) -> &'a ModelIdentity {
        self.model_identity
    }

    pub fn model_config(&self) -> &'a ModelConfig {
        self.model_config
    }

    pub fn hf_config_usize(&self, path: &[&str]) -> Option<usize> {
        self.model_config.hf_config_usize(path)
    }
}
