//! Suite builder.

use tonetest_core::config::SuiteConfig;
use tonetest_core::error::RegistryError;

use crate::registry::Registry;
use crate::step::Step;

/// A configured, ordered set of steps.
///
/// Built explicitly by the call site; nothing registers itself.
#[derive(Debug, Clone)]
pub struct Suite {
    config: SuiteConfig,
    registry: Registry,
}

impl Suite {
    pub fn new(config: SuiteConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
        }
    }

    /// Adds a step, builder style.
    pub fn step(mut self, step: Step) -> Result<Self, RegistryError> {
        self.registry.add(step)?;
        Ok(self)
    }

    /// Adds a step in place.
    pub fn add_step(&mut self, step: Step) -> Result<(), RegistryError> {
        self.registry.add(step)
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SuiteConfig {
        &mut self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }
}
