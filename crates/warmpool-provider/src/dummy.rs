//! In-memory provider for local runs and tests.
//!
//! Machines are created instantly, ready and powered on. Every state change
//! a real hypervisor could make is exposed as a knob so tests can script
//! inventory drift, failures and host load.
//!
//! Options (`[providers.<name>]`):
//!
//! ```toml
//! provider_class = "dummy"
//! cluster = "dummy-cluster"
//! hosts = ["dummy-host-1", "dummy-host-2"]
//! compat_class = "dummy-v1"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;
use warmpool_core::{ProviderSettings, epoch_secs};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{Provider, ProviderFuture};
use crate::types::{HostStats, MachineAttrs, MachinePlacement};

/// Registry constructor for the `dummy` class.
pub fn build(name: &str, settings: &ProviderSettings) -> ProviderResult<Arc<dyn Provider>> {
    Ok(Arc::new(DummyProvider::from_settings(name, settings)?))
}

struct DummyMachine {
    attrs: MachineAttrs,
    ready: bool,
    placement: MachinePlacement,
    disks: Vec<u32>,
    snapshots: Vec<String>,
}

#[derive(Default)]
struct DummyState {
    pools: HashMap<String, BTreeMap<String, DummyMachine>>,
    hosts: HashMap<String, Vec<HostStats>>,
    next_host: usize,
    failing_creates: usize,
    failing_listing: bool,
    create_delay: Option<Duration>,
    relocations: Vec<(String, String)>,
    calls: HashMap<&'static str, usize>,
}

impl DummyState {
    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }

    fn machine_mut(&mut self, pool: &str, machine: &str) -> ProviderResult<&mut DummyMachine> {
        self.pools
            .get_mut(pool)
            .and_then(|machines| machines.get_mut(machine))
            .ok_or_else(|| ProviderError::MachineNotFound(machine.to_string()))
    }
}

/// Provider keeping its whole inventory in process memory.
pub struct DummyProvider {
    name: String,
    cluster: String,
    compat_class: String,
    host_names: Vec<String>,
    state: Mutex<DummyState>,
}

impl DummyProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hosts(
            name,
            "dummy-cluster",
            "dummy-v1",
            vec!["dummy-host-1".to_string(), "dummy-host-2".to_string()],
        )
    }

    pub fn with_hosts(
        name: impl Into<String>,
        cluster: impl Into<String>,
        compat_class: impl Into<String>,
        host_names: Vec<String>,
    ) -> Self {
        let cluster = cluster.into();
        let compat_class = compat_class.into();
        let stats = host_names
            .iter()
            .enumerate()
            .map(|(i, host)| HostStats {
                name: host.clone(),
                compat_class: compat_class.clone(),
                in_maintenance: false,
                healthy: true,
                cpu_percent: 10.0 + 10.0 * i as f64,
                memory_percent: 20.0,
            })
            .collect();
        let mut state = DummyState::default();
        state.hosts.insert(cluster.clone(), stats);
        Self {
            name: name.into(),
            cluster,
            compat_class,
            host_names,
            state: Mutex::new(state),
        }
    }

    pub fn from_settings(name: &str, settings: &ProviderSettings) -> ProviderResult<Self> {
        let invalid = |message: &str| ProviderError::InvalidOption {
            provider: name.to_string(),
            message: message.to_string(),
        };
        let string_option = |key: &str, default: &str| -> ProviderResult<String> {
            match settings.options.get(key) {
                None => Ok(default.to_string()),
                Some(value) => value
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(&format!("'{key}' must be a string"))),
            }
        };

        let cluster = string_option("cluster", "dummy-cluster")?;
        let compat_class = string_option("compat_class", "dummy-v1")?;
        let hosts = match settings.options.get("hosts") {
            None => vec!["dummy-host-1".to_string(), "dummy-host-2".to_string()],
            Some(value) => value
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|item| item.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .filter(|hosts| !hosts.is_empty())
                .ok_or_else(|| invalid("'hosts' must be a non-empty list of strings"))?,
        };
        Ok(Self::with_hosts(name, cluster, compat_class, hosts))
    }

    // ── Knobs ──────────────────────────────────────────────────────

    /// Add a machine to `pool` on the first host, ready for use.
    pub async fn insert_machine(&self, pool: &str, attrs: MachineAttrs) {
        let placement = self.placement_on(0);
        let mut state = self.state.lock().await;
        state.pools.entry(pool.to_string()).or_default().insert(
            attrs.name.clone(),
            DummyMachine {
                attrs,
                ready: true,
                placement,
                disks: Vec::new(),
                snapshots: Vec::new(),
            },
        );
    }

    /// Drop a machine from inventory without destroying it through the API.
    pub async fn remove_machine(&self, pool: &str, machine: &str) -> bool {
        let mut state = self.state.lock().await;
        state
            .pools
            .get_mut(pool)
            .is_some_and(|machines| machines.remove(machine).is_some())
    }

    pub async fn set_ready(&self, pool: &str, machine: &str, ready: bool) {
        let mut state = self.state.lock().await;
        if let Ok(m) = state.machine_mut(pool, machine) {
            m.ready = ready;
        }
    }

    pub async fn update_machine(&self, pool: &str, machine: &str, f: impl FnOnce(&mut MachineAttrs)) {
        let mut state = self.state.lock().await;
        if let Ok(m) = state.machine_mut(pool, machine) {
            f(&mut m.attrs);
        }
    }

    pub async fn set_placement(&self, pool: &str, machine: &str, placement: MachinePlacement) {
        let mut state = self.state.lock().await;
        if let Ok(m) = state.machine_mut(pool, machine) {
            m.placement = placement;
        }
    }

    pub async fn set_host_stats(&self, cluster: &str, hosts: Vec<HostStats>) {
        let mut state = self.state.lock().await;
        state.hosts.insert(cluster.to_string(), hosts);
    }

    /// Forget `cluster`'s hosts so host lookups for it fail.
    pub async fn clear_host_stats(&self, cluster: &str) {
        self.state.lock().await.hosts.remove(cluster);
    }

    /// Make the next `count` create calls fail.
    pub async fn fail_creates(&self, count: usize) {
        self.state.lock().await.failing_creates = count;
    }

    pub async fn fail_listing(&self, failing: bool) {
        self.state.lock().await.failing_listing = failing;
    }

    /// Hold every create call for `delay` before it completes.
    pub async fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.create_delay = delay;
    }

    /// `(machine, target host)` pairs in relocation order.
    pub async fn relocations(&self) -> Vec<(String, String)> {
        self.state.lock().await.relocations.clone()
    }

    /// How many times `op` (a trait method name) was called.
    pub async fn calls(&self, op: &str) -> usize {
        self.state.lock().await.calls.get(op).copied().unwrap_or(0)
    }

    pub async fn machine_names(&self, pool: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .pools
            .get(pool)
            .map(|machines| machines.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn disks(&self, pool: &str, machine: &str) -> Vec<u32> {
        let mut state = self.state.lock().await;
        state
            .machine_mut(pool, machine)
            .map(|m| m.disks.clone())
            .unwrap_or_default()
    }

    pub async fn snapshots(&self, pool: &str, machine: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        state
            .machine_mut(pool, machine)
            .map(|m| m.snapshots.clone())
            .unwrap_or_default()
    }

    fn placement_on(&self, index: usize) -> MachinePlacement {
        let host = self
            .host_names
            .get(index % self.host_names.len().max(1))
            .cloned()
            .unwrap_or_default();
        MachinePlacement {
            host,
            cluster: self.cluster.clone(),
            compat_class: self.compat_class.clone(),
        }
    }
}

impl Provider for DummyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn machines_in_pool<'a>(&'a self, pool: &'a str) -> ProviderFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("machines_in_pool");
            if state.failing_listing {
                return Err(ProviderError::Operation {
                    operation: "list",
                    machine: pool.to_string(),
                    message: "inventory unavailable".to_string(),
                });
            }
            Ok(state
                .pools
                .get(pool)
                .map(|machines| machines.keys().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn get_machine<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
    ) -> ProviderFuture<'a, Option<MachineAttrs>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("get_machine");
            Ok(state.machine_mut(pool, machine).ok().map(|m| m.attrs.clone()))
        })
    }

    fn is_ready<'a>(&'a self, pool: &'a str, machine: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("is_ready");
            Ok(state.machine_mut(pool, machine).is_ok_and(|m| m.ready))
        })
    }

    fn create_machine<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
    ) -> ProviderFuture<'a, MachineAttrs> {
        Box::pin(async move {
            let delay = {
                let mut state = self.state.lock().await;
                state.record("create_machine");
                if state.failing_creates > 0 {
                    state.failing_creates -= 1;
                    return Err(ProviderError::Operation {
                        operation: "create",
                        machine: machine.to_string(),
                        message: "clone failed".to_string(),
                    });
                }
                state.create_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let attrs = MachineAttrs::running(machine, epoch_secs());
            let mut state = self.state.lock().await;
            let index = state.next_host;
            state.next_host += 1;
            state.pools.entry(pool.to_string()).or_default().insert(
                machine.to_string(),
                DummyMachine {
                    attrs: attrs.clone(),
                    ready: true,
                    placement: self.placement_on(index),
                    disks: Vec::new(),
                    snapshots: Vec::new(),
                },
            );
            debug!(provider = %self.name, %pool, %machine, "dummy machine created");
            Ok(attrs)
        })
    }

    fn destroy_machine<'a>(&'a self, pool: &'a str, machine: &'a str) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("destroy_machine");
            let removed = state
                .pools
                .get_mut(pool)
                .is_some_and(|machines| machines.remove(machine).is_some());
            Ok(removed)
        })
    }

    fn attach_disk<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
        size_gb: u32,
    ) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("attach_disk");
            state.machine_mut(pool, machine)?.disks.push(size_gb);
            Ok(true)
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("create_snapshot");
            let m = state.machine_mut(pool, machine)?;
            if m.snapshots.iter().any(|s| s == snapshot) {
                return Ok(false);
            }
            m.snapshots.push(snapshot.to_string());
            Ok(true)
        })
    }

    fn revert_snapshot<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("revert_snapshot");
            let m = state.machine_mut(pool, machine)?;
            Ok(m.snapshots.iter().any(|s| s == snapshot))
        })
    }

    fn machine_placement<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
    ) -> ProviderFuture<'a, MachinePlacement> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("machine_placement");
            Ok(state.machine_mut(pool, machine)?.placement.clone())
        })
    }

    fn host_stats<'a>(&'a self, cluster: &'a str) -> ProviderFuture<'a, Vec<HostStats>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record("host_stats");
            state
                .hosts
                .get(cluster)
                .cloned()
                .ok_or_else(|| ProviderError::NoHosts(cluster.to_string()))
        })
    }

    fn relocate<'a>(&'a self, machine: &'a str, host: &'a str) -> ProviderFuture<'a, Duration> {
        Box::pin(async move {
            let started = Instant::now();
            let mut state = self.state.lock().await;
            state.record("relocate");
            let target = state
                .pools
                .values_mut()
                .find_map(|machines| machines.get_mut(machine))
                .ok_or_else(|| ProviderError::MachineNotFound(machine.to_string()))?;
            target.placement.host = host.to_string();
            state
                .relocations
                .push((machine.to_string(), host.to_string()));
            Ok(started.elapsed())
        })
    }
}
