//! Candidate selection over ranked hosts.

use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;
use warmpool_provider::RankedHost;

/// Active candidates of one cluster.
#[derive(Debug, Clone)]
pub struct ClusterCandidates {
    /// Rotating candidate list per compatibility class.
    pub classes: HashMap<String, VecDeque<String>>,
    /// Every eligible host of the cluster, least loaded first.
    pub hosts: Vec<String>,
    pub refreshed_at: Instant,
}

impl ClusterCandidates {
    pub fn build(ranked: &[RankedHost], percentage: u32) -> Self {
        Self {
            classes: partition_by_class(ranked, percentage),
            hosts: ranked.iter().map(|h| h.name.clone()).collect(),
            refreshed_at: Instant::now(),
        }
    }

    /// Take the head of `class`'s list and move it to the tail.
    pub fn rotate(&mut self, class: &str) -> Option<String> {
        let list = self.classes.get_mut(class)?;
        let host = list.pop_front()?;
        list.push_back(host.clone());
        Some(host)
    }
}

/// Keep the hosts strictly below the average utilization, least loaded
/// first, at most `percentage` percent of the input.
///
/// Never empty for a non-empty input: when no host is below average (all
/// equally loaded) the least loaded hosts are kept, and the cap is at
/// least one.
pub fn select_least_used(hosts: &[RankedHost], percentage: u32) -> Vec<String> {
    if hosts.is_empty() {
        return Vec::new();
    }
    let average = hosts.iter().map(|h| h.utilization).sum::<f64>() / hosts.len() as f64;
    let cap = ((hosts.len() as f64 * f64::from(percentage) / 100.0).ceil() as usize).max(1);

    let mut below: Vec<&RankedHost> = hosts.iter().filter(|h| h.utilization < average).collect();
    if below.is_empty() {
        below = hosts.iter().collect();
    }
    below.sort_by(|a, b| a.utilization.total_cmp(&b.utilization));
    below
        .into_iter()
        .take(cap)
        .map(|h| h.name.clone())
        .collect()
}

/// Group hosts by compatibility class and select candidates within each.
pub fn partition_by_class(hosts: &[RankedHost], percentage: u32) -> HashMap<String, VecDeque<String>> {
    let mut classes: HashMap<&str, Vec<RankedHost>> = HashMap::new();
    for host in hosts {
        classes
            .entry(host.compat_class.as_str())
            .or_default()
            .push(host.clone());
    }
    classes
        .into_iter()
        .map(|(class, members)| {
            (
                class.to_string(),
                select_least_used(&members, percentage).into(),
            )
        })
        .collect()
}
