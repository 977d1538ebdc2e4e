//! Host candidate cache.
//!
//! Refreshed by the host selector worker, consumed by migrations. Only one
//! refresh runs at a time across every holder of the same store: the guard
//! key `hostselector:checking` is taken with `set_if_absent` and released
//! when the refresh finishes, whatever its outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};
use warmpool_core::{Config, HostSelectionSettings, epoch_secs};
use warmpool_provider::Provider;
use warmpool_state::{InventoryStore, keys};

use crate::error::HostSelectionError;
use crate::selection::ClusterCandidates;

/// Releases the persisted refresh guard on drop.
struct RefreshGuard<'a> {
    store: &'a InventoryStore,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.del(keys::HOST_SELECTION_GUARD) {
            warn!(error = %e, "failed to release host selection guard");
        }
    }
}

/// Per-cluster ranked host candidates. Clones share the same cache.
#[derive(Clone)]
pub struct HostCache {
    clusters: Arc<RwLock<HashMap<String, ClusterCandidates>>>,
    targets: Arc<Vec<(String, Arc<dyn Provider>)>>,
    store: InventoryStore,
    settings: HostSelectionSettings,
}

impl HostCache {
    /// Create an empty cache over explicit `(cluster, provider)` targets.
    pub fn new(
        store: InventoryStore,
        settings: HostSelectionSettings,
        targets: Vec<(String, Arc<dyn Provider>)>,
    ) -> Self {
        Self {
            clusters: Arc::new(RwLock::new(HashMap::new())),
            targets: Arc::new(targets),
            store,
            settings,
        }
    }

    /// Create an empty cache covering every cluster a pool clones into.
    ///
    /// Clusters are deduplicated; the first pool naming a cluster decides
    /// which provider is asked about it. Pools without a cluster or whose
    /// provider is missing from `providers` are skipped.
    pub fn from_config(
        config: &Config,
        store: InventoryStore,
        providers: &HashMap<String, Arc<dyn Provider>>,
    ) -> Self {
        let mut targets: Vec<(String, Arc<dyn Provider>)> = Vec::new();
        for pool in &config.pools {
            let Some(cluster) = pool.cluster(&config.config) else {
                continue;
            };
            if targets.iter().any(|(c, _)| c == cluster) {
                continue;
            }
            let provider = pool.provider.as_deref().and_then(|p| providers.get(p));
            if let Some(provider) = provider {
                targets.push((cluster.to_string(), provider.clone()));
            }
        }
        Self::new(store, config.config.host_selection.clone(), targets)
    }

    /// Clusters this cache refreshes.
    pub fn clusters(&self) -> Vec<String> {
        self.targets.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Re-rank every target cluster.
    ///
    /// Returns false without doing anything if another refresh holds the
    /// guard. A cluster whose provider call fails keeps its previous entry.
    pub async fn refresh(&self) -> Result<bool, HostSelectionError> {
        let stamp = epoch_secs().to_string();
        if !self.store.set_if_absent(keys::HOST_SELECTION_GUARD, &stamp)? {
            debug!("host selection refresh already running");
            return Ok(false);
        }
        let _guard = RefreshGuard { store: &self.store };

        for (cluster, provider) in self.targets.iter() {
            match provider
                .rank_hosts(cluster, self.settings.utilization_ceiling)
                .await
            {
                Ok(ranked) => {
                    let candidates =
                        ClusterCandidates::build(&ranked, self.settings.candidate_percentage);
                    debug!(
                        %cluster,
                        eligible = ranked.len(),
                        classes = candidates.classes.len(),
                        "host candidates refreshed"
                    );
                    self.clusters
                        .write()
                        .await
                        .insert(cluster.clone(), candidates);
                }
                Err(e) => {
                    warn!(%cluster, provider = %provider.name(), error = %e, "host ranking failed");
                }
            }
        }
        Ok(true)
    }

    /// Next candidate host of `class` in `cluster`, rotating it to the tail.
    ///
    /// A missing or stale entry triggers a refresh and is re-checked up to
    /// `wait_attempts` times, sleeping `wait_millis` after every attempt
    /// that leaves it missing or stale. When the attempts run out a stale
    /// entry is still used.
    pub async fn next_host(&self, cluster: &str, class: &str) -> Result<String, HostSelectionError> {
        if !self.targets.iter().any(|(c, _)| c == cluster) {
            return Err(HostSelectionError::UnknownCluster(cluster.to_string()));
        }
        let stale_after = Duration::from_secs(self.settings.stale_after_secs);
        let wait = Duration::from_millis(self.settings.wait_millis);

        if let Some(found) = self.pick(cluster, class, Some(stale_after)).await {
            return found;
        }
        for attempt in 0..self.settings.wait_attempts {
            debug!(%cluster, attempt, "host candidates missing or stale");
            self.refresh().await?;
            if let Some(found) = self.pick(cluster, class, Some(stale_after)).await {
                return found;
            }
            tokio::time::sleep(wait).await;
        }
        if let Some(found) = self.pick(cluster, class, None).await {
            warn!(%cluster, %class, "using stale host candidates");
            return found;
        }
        Err(HostSelectionError::NoCandidate {
            cluster: cluster.to_string(),
            class: class.to_string(),
        })
    }

    /// Rotate `class` in `cluster` if an entry exists and, when `stale_after`
    /// is given, is younger than it.
    async fn pick(
        &self,
        cluster: &str,
        class: &str,
        stale_after: Option<Duration>,
    ) -> Option<Result<String, HostSelectionError>> {
        let mut clusters = self.clusters.write().await;
        let entry = clusters.get_mut(cluster)?;
        if stale_after.is_some_and(|limit| entry.refreshed_at.elapsed() >= limit) {
            return None;
        }
        Some(entry.rotate(class).ok_or_else(|| HostSelectionError::NoCandidate {
            cluster: cluster.to_string(),
            class: class.to_string(),
        }))
    }

    /// Current candidate list of `class` in `cluster`, head first.
    pub async fn candidates(&self, cluster: &str, class: &str) -> Vec<String> {
        let clusters = self.clusters.read().await;
        clusters
            .get(cluster)
            .and_then(|entry| entry.classes.get(class))
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every eligible host of `cluster`, least loaded first.
    pub async fn hosts(&self, cluster: &str) -> Vec<String> {
        let clusters = self.clusters.read().await;
        clusters
            .get(cluster)
            .map(|entry| entry.hosts.clone())
            .unwrap_or_default()
    }

    /// Refresh every `refresh_secs` until shutdown or `max_iterations`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, max_iterations: Option<u64>) {
        let interval = Duration::from_secs(self.settings.refresh_secs);
        info!(
            clusters = self.targets.len(),
            interval_secs = interval.as_secs(),
            "host selector started"
        );
        let mut iterations = 0u64;
        loop {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "host selection refresh failed");
            }
            iterations += 1;
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("host selector shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warmpool_core::PoolSettings;
    use warmpool_provider::{DummyProvider, HostStats};

    fn stats(name: &str, class: &str, cpu: f64) -> HostStats {
        HostStats {
            name: name.to_string(),
            compat_class: class.to_string(),
            in_maintenance: false,
            healthy: true,
            cpu_percent: cpu,
            memory_percent: 30.0,
        }
    }

    fn settings() -> HostSelectionSettings {
        HostSelectionSettings {
            candidate_percentage: 100,
            wait_attempts: 3,
            wait_millis: 10,
            ..HostSelectionSettings::default()
        }
    }

    async fn cache_with(hosts: Vec<HostStats>) -> (HostCache, Arc<DummyProvider>, InventoryStore) {
        let provider = Arc::new(DummyProvider::new("dummy"));
        provider.set_host_stats("c1", hosts).await;
        let store = InventoryStore::open_in_memory().unwrap();
        let cache = HostCache::new(
            store.clone(),
            settings(),
            vec![("c1".to_string(), provider.clone() as Arc<dyn Provider>)],
        );
        (cache, provider, store)
    }

    #[tokio::test]
    async fn refresh_then_rotate() {
        let (cache, _, store) = cache_with(vec![
            stats("a", "v4", 10.0),
            stats("b", "v4", 20.0),
            stats("c", "v4", 70.0),
            stats("x", "v3", 15.0),
        ])
        .await;

        assert!(cache.refresh().await.unwrap());
        assert_eq!(cache.candidates("c1", "v4").await, vec!["a", "b"]);
        assert_eq!(cache.hosts("c1").await, vec!["a", "x", "b", "c"]);
        assert_eq!(cache.next_host("c1", "v4").await.unwrap(), "a");
        assert_eq!(cache.next_host("c1", "v4").await.unwrap(), "b");
        assert_eq!(cache.next_host("c1", "v4").await.unwrap(), "a");
        assert_eq!(cache.next_host("c1", "v3").await.unwrap(), "x");
        // Guard released after refresh.
        assert!(store.get(keys::HOST_SELECTION_GUARD).unwrap().is_none());
    }

    #[tokio::test]
    async fn guard_rejects_overlapping_refresh() {
        let (cache, _, store) = cache_with(vec![stats("a", "v4", 10.0)]).await;
        store.set(keys::HOST_SELECTION_GUARD, "1").unwrap();
        assert!(!cache.refresh().await.unwrap());
        assert!(cache.candidates("c1", "v4").await.is_empty());
    }

    #[tokio::test]
    async fn missing_entry_triggers_refresh() {
        let (cache, provider, _) = cache_with(vec![stats("a", "v4", 10.0)]).await;
        assert_eq!(cache.next_host("c1", "v4").await.unwrap(), "a");
        assert_eq!(provider.calls("host_stats").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_refreshed() {
        let (cache, provider, _) = cache_with(vec![stats("a", "v4", 10.0)]).await;
        cache.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        provider
            .set_host_stats("c1", vec![stats("b", "v4", 10.0)])
            .await;
        assert_eq!(cache.next_host("c1", "v4").await.unwrap(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up() {
        let (cache, _, store) = cache_with(vec![stats("a", "v4", 10.0)]).await;
        // Another process holds the guard and never finishes.
        store.set(keys::HOST_SELECTION_GUARD, "1").unwrap();
        let err = cache.next_host("c1", "v4").await.unwrap_err();
        assert!(matches!(err, HostSelectionError::NoCandidate { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_ranking_sleeps_between_attempts() {
        let (cache, provider, _) = cache_with(vec![]).await;
        provider.clear_host_stats("c1").await;

        let started = tokio::time::Instant::now();
        let err = cache.next_host("c1", "v4").await.unwrap_err();
        assert!(matches!(err, HostSelectionError::NoCandidate { .. }));
        assert_eq!(provider.calls("host_stats").await, 3);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_used_when_ranking_fails() {
        let (cache, provider, _) = cache_with(vec![stats("a", "v4", 10.0)]).await;
        cache.refresh().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        provider.clear_host_stats("c1").await;

        assert_eq!(cache.next_host("c1", "v4").await.unwrap(), "a");
        assert_eq!(provider.calls("host_stats").await, 4);
    }

    #[tokio::test]
    async fn unknown_class_and_cluster() {
        let (cache, _, _) = cache_with(vec![stats("a", "v4", 10.0)]).await;
        cache.refresh().await.unwrap();
        assert!(matches!(
            cache.next_host("c1", "v9").await,
            Err(HostSelectionError::NoCandidate { .. })
        ));
        assert!(matches!(
            cache.next_host("elsewhere", "v4").await,
            Err(HostSelectionError::UnknownCluster(_))
        ));
    }

    #[tokio::test]
    async fn from_config_dedups_clusters() {
        let mut config = Config::default();
        config.config.clone_target = Some("c1".to_string());
        config.pools.push(PoolSettings::new("a", 1, "dummy"));
        config.pools.push(PoolSettings::new("b", 1, "dummy"));
        let mut other = PoolSettings::new("c", 1, "dummy");
        other.clone_target = Some("c2".to_string());
        config.pools.push(other);
        config.pools.push(PoolSettings::new("d", 1, "missing"));

        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("dummy".to_string(), Arc::new(DummyProvider::new("dummy")));

        let cache = HostCache::from_config(&config, InventoryStore::open_in_memory().unwrap(), &providers);
        assert_eq!(cache.clusters(), vec!["c1", "c2"]);
    }
}
