//! Ordered, uniquely named step collection.

use tonetest_core::error::RegistryError;
use tonetest_core::topic::sanitize_token;

use crate::step::Step;

/// Steps in registration order.
///
/// Names are unique; there is no removal or reordering.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    steps: Vec<Step>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    ///
    /// Fails with [`RegistryError::DuplicateStepName`] if the name is taken,
    /// or [`RegistryError::StepTopicCollision`] if another step's name maps
    /// to the same topic token. The registry is left unchanged on error.
    pub fn add(&mut self, step: Step) -> Result<(), RegistryError> {
        if self.contains(step.name()) {
            return Err(RegistryError::DuplicateStepName {
                name: step.name().to_owned(),
            });
        }
        let token = sanitize_token(step.name());
        if let Some(existing) = self
            .steps
            .iter()
            .find(|s| sanitize_token(s.name()) == token)
        {
            return Err(RegistryError::StepTopicCollision {
                name: step.name().to_owned(),
                existing: existing.name().to_owned(),
                token,
            });
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Step names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }
}
