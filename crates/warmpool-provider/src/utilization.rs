//! Host utilization filtering and ranking.

use tracing::debug;

use crate::types::{HostStats, RankedHost};

/// Drop hosts that must not receive machines and rank the rest by CPU
/// utilization, least loaded first.
///
/// A host is excluded when it is in maintenance, unhealthy, reports zero CPU
/// or memory usage (statistics not yet available), or exceeds `ceiling`
/// percent on either resource.
pub fn rank_by_utilization(hosts: Vec<HostStats>, ceiling: f64) -> Vec<RankedHost> {
    let mut ranked: Vec<RankedHost> = hosts
        .into_iter()
        .filter(|h| {
            let usable = !h.in_maintenance
                && h.healthy
                && h.cpu_percent > 0.0
                && h.memory_percent > 0.0
                && h.cpu_percent <= ceiling
                && h.memory_percent <= ceiling;
            if !usable {
                debug!(host = %h.name, cpu = h.cpu_percent, memory = h.memory_percent, "host excluded");
            }
            usable
        })
        .map(|h| RankedHost {
            name: h.name,
            compat_class: h.compat_class,
            utilization: h.cpu_percent,
        })
        .collect();
    ranked.sort_by(|a, b| a.utilization.total_cmp(&b.utilization));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, cpu: f64, memory: f64) -> HostStats {
        HostStats {
            name: name.to_string(),
            compat_class: "v4".to_string(),
            in_maintenance: false,
            healthy: true,
            cpu_percent: cpu,
            memory_percent: memory,
        }
    }

    #[test]
    fn ranks_by_cpu_ascending() {
        let ranked = rank_by_utilization(
            vec![host("a", 40.0, 10.0), host("b", 5.0, 50.0), host("c", 20.0, 20.0)],
            80.0,
        );
        let names: Vec<_> = ranked.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "a"]);
        assert_eq!(ranked[0].utilization, 5.0);
    }

    #[test]
    fn excludes_unusable_hosts() {
        let mut maintenance = host("maint", 10.0, 10.0);
        maintenance.in_maintenance = true;
        let mut red = host("red", 10.0, 10.0);
        red.healthy = false;

        let ranked = rank_by_utilization(
            vec![
                maintenance,
                red,
                host("no-stats", 0.0, 10.0),
                host("no-memory-stats", 10.0, 0.0),
                host("hot-cpu", 81.0, 10.0),
                host("hot-memory", 10.0, 95.0),
                host("ok", 80.0, 80.0),
            ],
            80.0,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "ok");
    }
}
