//! The provider capability trait.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::ProviderResult;
use crate::types::{HostStats, MachineAttrs, MachinePlacement, RankedHost};
use crate::utilization::rank_by_utilization;

/// Boxed future returned by every provider call.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// Operations the pool manager needs from a hypervisor backend.
///
/// Calls carry no deadline; implementations may block for as long as the
/// backend takes. Pool-scoped calls receive the pool name so a backend can
/// resolve folders, templates or clusters per pool.
pub trait Provider: Send + Sync {
    /// Name this provider was configured under.
    fn name(&self) -> &str;

    /// Names of every machine the backend currently holds for `pool`.
    fn machines_in_pool<'a>(&'a self, pool: &'a str) -> ProviderFuture<'a, Vec<String>>;

    /// Attributes of `machine`, or `None` if the backend does not know it.
    fn get_machine<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
    ) -> ProviderFuture<'a, Option<MachineAttrs>>;

    /// Whether `machine` is reachable and ready for use.
    fn is_ready<'a>(&'a self, pool: &'a str, machine: &'a str) -> ProviderFuture<'a, bool>;

    /// Clone a new machine named `machine` into `pool`.
    fn create_machine<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
    ) -> ProviderFuture<'a, MachineAttrs>;

    /// Destroy `machine`. Returns false if there was nothing to destroy.
    fn destroy_machine<'a>(&'a self, pool: &'a str, machine: &'a str) -> ProviderFuture<'a, bool>;

    fn attach_disk<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
        size_gb: u32,
    ) -> ProviderFuture<'a, bool>;

    fn create_snapshot<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, bool>;

    fn revert_snapshot<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, bool>;

    /// Current host, cluster and compatibility class of `machine`.
    fn machine_placement<'a>(
        &'a self,
        pool: &'a str,
        machine: &'a str,
    ) -> ProviderFuture<'a, MachinePlacement>;

    /// Raw utilization of every host in `cluster`.
    fn host_stats<'a>(&'a self, cluster: &'a str) -> ProviderFuture<'a, Vec<HostStats>>;

    /// Hosts of `cluster` eligible for placement, least utilized first.
    fn rank_hosts<'a>(&'a self, cluster: &'a str, ceiling: f64) -> ProviderFuture<'a, Vec<RankedHost>> {
        Box::pin(async move {
            let stats = self.host_stats(cluster).await?;
            Ok(rank_by_utilization(stats, ceiling))
        })
    }

    /// Move `machine` to `host`, returning how long the relocation took.
    fn relocate<'a>(&'a self, machine: &'a str, host: &'a str) -> ProviderFuture<'a, Duration>;
}
