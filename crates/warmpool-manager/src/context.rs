//! The runtime context shared by every worker.

use std::collections::HashMap;
use std::sync::Arc;

use warmpool_core::{Config, PoolSettings};
use warmpool_hosts::HostCache;
use warmpool_metrics::MetricsCollector;
use warmpool_provider::Provider;
use warmpool_state::InventoryStore;

use crate::dispatch::Dispatcher;
use crate::error::{ManagerError, ManagerResult};

/// Everything a worker needs, constructed once at startup.
pub struct Context {
    pub config: Arc<Config>,
    pub store: InventoryStore,
    /// Provider name → provider.
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub hosts: HostCache,
    pub metrics: MetricsCollector,
    pub dispatcher: Dispatcher,
}

impl Context {
    /// Build the context, failing if any pool names a provider that was not
    /// created.
    pub fn new(
        config: Config,
        store: InventoryStore,
        providers: HashMap<String, Arc<dyn Provider>>,
    ) -> ManagerResult<Arc<Self>> {
        config.validate()?;
        for pool in &config.pools {
            let provider = pool.provider.clone().unwrap_or_default();
            if !providers.contains_key(&provider) {
                return Err(ManagerError::MissingProvider {
                    pool: pool.name.clone(),
                    provider,
                });
            }
        }
        let hosts = HostCache::from_config(&config, store.clone(), &providers);
        Ok(Arc::new(Self {
            config: Arc::new(config),
            store,
            providers,
            hosts,
            metrics: MetricsCollector::new(),
            dispatcher: Dispatcher::new(),
        }))
    }

    pub fn pool(&self, name: &str) -> ManagerResult<&PoolSettings> {
        self.config
            .pool(name)
            .ok_or_else(|| ManagerError::UnknownPool(name.to_string()))
    }

    /// Provider serving `pool`.
    pub fn provider_for(&self, pool: &str) -> ManagerResult<Arc<dyn Provider>> {
        let settings = self.pool(pool)?;
        let name = settings.provider.clone().unwrap_or_default();
        self.providers
            .get(&name)
            .cloned()
            .ok_or(ManagerError::MissingProvider {
                pool: pool.to_string(),
                provider: name,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warmpool_provider::DummyProvider;

    fn providers() -> HashMap<String, Arc<dyn Provider>> {
        let mut map: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        map.insert("dummy".into(), Arc::new(DummyProvider::new("dummy")));
        map
    }

    #[test]
    fn resolves_pool_providers() {
        let mut config = Config::default();
        config.pools.push(PoolSettings::new("debian", 2, "dummy"));
        let ctx = Context::new(config, InventoryStore::open_in_memory().unwrap(), providers()).unwrap();

        assert_eq!(ctx.provider_for("debian").unwrap().name(), "dummy");
        assert!(matches!(
            ctx.provider_for("nope"),
            Err(ManagerError::UnknownPool(_))
        ));
    }

    #[test]
    fn missing_provider_is_fatal() {
        let mut config = Config::default();
        config.pools.push(PoolSettings::new("debian", 2, "vsphere"));
        let err = Context::new(config, InventoryStore::open_in_memory().unwrap(), providers())
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::MissingProvider { ref provider, .. } if provider == "vsphere"));
    }

    #[test]
    fn invalid_config_is_fatal() {
        let err = Context::new(Config::default(), InventoryStore::open_in_memory().unwrap(), providers())
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::Config(_)));
    }
}
