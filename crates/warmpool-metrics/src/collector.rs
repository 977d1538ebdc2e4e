//! Metrics collector — counters, gauges and timing samples by name.
//!
//! Counters and gauges are atomics behind a shared map so the hot path only
//! takes the read lock once a name has been seen. Timing samples are kept
//! in a bounded window per name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Samples kept per timing metric.
const TIMING_WINDOW: usize = 1024;

#[derive(Default)]
struct TimingSeries {
    count: AtomicU64,
    samples: Mutex<Vec<f64>>,
}

/// Aggregated view of one timing metric.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSummary {
    /// Samples recorded since startup.
    pub count: u64,
    /// Mean of the retained window, in seconds.
    pub mean_secs: f64,
    /// Largest retained sample, in seconds.
    pub max_secs: f64,
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, TimingSummary>,
}

/// Shared in-process metrics sink. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
    gauges: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
    timings: Arc<RwLock<HashMap<String, Arc<TimingSeries>>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to the counter `name`.
    pub async fn increment(&self, name: &str) {
        cell(&self.counters, name)
            .await
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Set the gauge `name` to `value`.
    pub async fn gauge(&self, name: &str, value: u64) {
        cell(&self.gauges, name).await.store(value, Ordering::Relaxed);
    }

    /// Record one duration sample for `name`.
    pub async fn timing(&self, name: &str, elapsed: Duration) {
        let series = {
            let map = self.timings.read().await;
            map.get(name).cloned()
        };
        let series = match series {
            Some(series) => series,
            None => {
                let mut map = self.timings.write().await;
                map.entry(name.to_string()).or_default().clone()
            }
        };
        series.count.fetch_add(1, Ordering::Relaxed);
        let mut samples = series.samples.lock().await;
        if samples.len() == TIMING_WINDOW {
            samples.remove(0);
        }
        samples.push(elapsed.as_secs_f64());
        debug!(metric = %name, secs = elapsed.as_secs_f64(), "timing recorded");
    }

    pub async fn counter_value(&self, name: &str) -> u64 {
        let map = self.counters.read().await;
        map.get(name).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub async fn gauge_value(&self, name: &str) -> Option<u64> {
        let map = self.gauges.read().await;
        map.get(name).map(|g| g.load(Ordering::Relaxed))
    }

    /// Number of samples ever recorded for `name`.
    pub async fn timing_count(&self, name: &str) -> u64 {
        let map = self.timings.read().await;
        map.get(name)
            .map(|t| t.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let counters = load_all(&self.counters).await;
        let gauges = load_all(&self.gauges).await;

        let mut timings = BTreeMap::new();
        let map = self.timings.read().await;
        for (name, series) in map.iter() {
            let samples = series.samples.lock().await;
            timings.insert(
                name.clone(),
                TimingSummary {
                    count: series.count.load(Ordering::Relaxed),
                    mean_secs: mean(&samples),
                    max_secs: samples.iter().copied().fold(0.0, f64::max),
                },
            );
        }

        MetricsSnapshot {
            counters,
            gauges,
            timings,
        }
    }
}

async fn cell(map: &RwLock<HashMap<String, Arc<AtomicU64>>>, name: &str) -> Arc<AtomicU64> {
    if let Some(existing) = map.read().await.get(name) {
        return existing.clone();
    }
    map.write()
        .await
        .entry(name.to_string())
        .or_default()
        .clone()
}

async fn load_all(map: &RwLock<HashMap<String, Arc<AtomicU64>>>) -> BTreeMap<String, u64> {
    map.read()
        .await
        .iter()
        .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
        .collect()
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}
