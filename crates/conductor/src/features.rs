//! Required manifest features. Every requirement must be validated by
//! something that consumes it, otherwise the manifest is rejected.

use paas_core::{PaasError, PaasResult};
use serde_json::Value as Json;

#[derive(Debug, Clone, Default)]
pub struct FeaturesRequirement {
    items: Vec<(String, bool)>,
}

impl FeaturesRequirement {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for r in required { set.require(r); }
        set
    }

    pub fn require(&mut self, feature: impl Into<String>) {
        let feature = feature.into();
        if !self.items.iter().any(|(f, _)| *f == feature) {
            self.items.push((feature, false));
        }
    }

    /// Mark a feature as consumed. Unknown features are ignored.
    pub fn validate(&mut self, feature: &str) {
        if let Some(entry) = self.items.iter_mut().find(|(f, _)| f == feature) {
            entry.1 = true;
        }
    }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn check_all_validated(&self) -> PaasResult<()> {
        let missing: Vec<String> = self.items.iter().filter(|(_, ok)| !ok).map(|(f, _)| format!("`{}`", f)).collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(PaasError::not_found(format!("{} not validated", missing.join(","))))
    }
}

/// Extension point: something able to honour a feature named in `paas.requires`.
pub trait FeatureValidator: Send + Sync {
    fn validate(&self, manifest: &Json, requirements: &mut FeaturesRequirement);
}

/// Validates a fixed list of feature names, e.g. capabilities of the installed drivers.
pub struct StaticFeatures(pub Vec<String>);

impl FeatureValidator for StaticFeatures {
    fn validate(&self, _manifest: &Json, requirements: &mut FeaturesRequirement) {
        for f in &self.0 { requirements.validate(f); }
    }
}
