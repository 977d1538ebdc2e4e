//! Provider registry: class token → constructor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use warmpool_core::{Config, ProviderSettings};

use crate::dummy;
use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;

/// Builds a provider from its configured name and settings.
pub type ProviderConstructor = fn(&str, &ProviderSettings) -> ProviderResult<Arc<dyn Provider>>;

/// Maps provider-class tokens to constructors.
pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("dummy", dummy::build);
        registry
    }
}

impl ProviderRegistry {
    /// Registry with the built-in classes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, class: impl Into<String>, constructor: ProviderConstructor) {
        self.constructors.insert(class.into(), constructor);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    /// Instantiate a provider of `class` under `name`.
    pub fn build(
        &self,
        class: &str,
        name: &str,
        settings: &ProviderSettings,
    ) -> ProviderResult<Arc<dyn Provider>> {
        let constructor = self
            .constructors
            .get(class)
            .ok_or_else(|| ProviderError::UnknownClass(class.to_string()))?;
        constructor(name, settings)
    }

    /// Instantiate every provider referenced by a pool, keyed by provider name.
    ///
    /// Fails on the first provider whose class is not registered.
    pub fn build_all(&self, config: &Config) -> ProviderResult<HashMap<String, Arc<dyn Provider>>> {
        let default_settings = ProviderSettings::default();
        let mut providers = HashMap::new();
        for name in config.provider_names() {
            let class = config.provider_class(name);
            let settings = config.providers.get(name).unwrap_or(&default_settings);
            let provider = self.build(class, name, settings)?;
            info!(provider = %name, %class, "provider created");
            providers.insert(name.to_string(), provider);
        }
        Ok(providers)
    }
}
