//! Provider registry: the static catalog of model descriptors

use tracing::debug;

use crate::error::PipelineError;
use crate::types::{Determinism, ModelDescriptor, SizeClass};

/// Immutable catalog of every model the router may call.
///
/// Registration order is kept and breaks priority ties.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    models: Vec<ModelDescriptor>,
}

impl ProviderRegistry {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        debug!("Provider registry loaded with {} models", models.len());
        Self { models }
    }

    /// Ordered fallback chain for a tier.
    ///
    /// Premium-only models are dropped unless `premium_allowed`. Ascending
    /// priority, ties in registration order. An empty chain is a
    /// configuration error.
    pub fn list_candidates(
        &self,
        size: SizeClass,
        premium_allowed: bool,
        determinism: Determinism,
    ) -> Result<Vec<ModelDescriptor>, PipelineError> {
        let mut candidates: Vec<ModelDescriptor> = self
            .models
            .iter()
            .filter(|m| m.size == size && m.determinism == determinism)
            .filter(|m| premium_allowed || !m.premium_only)
            .cloned()
            .collect();

        if candidates.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "no {} {} model configured{}",
                size,
                determinism,
                if premium_allowed {
                    ""
                } else {
                    " outside the premium tier"
                }
            )));
        }

        // sort_by_key is stable
        candidates.sort_by_key(|m| m.priority);
        Ok(candidates)
    }

    /// Distinct provider names in registration order
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for model in &self.models {
            if !names.contains(&model.provider) {
                names.push(model.provider.clone());
            }
        }
        names
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
