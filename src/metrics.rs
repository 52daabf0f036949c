//! Metrics dashboard: named numeric series reduced to summary statistics.
//!
//! Each series keeps running count/sum/min/max plus a bounded ring of recent
//! samples for the p95. `get_metrics` flattens everything into
//! `{name}_count`, `{name}_avg`, `{name}_min`, `{name}_max`, `{name}_p95`,
//! and adds `cache_hit_rate` when both cache series exist.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const CACHE_HIT: &str = "cache_hit";
pub const CACHE_MISS: &str = "cache_miss";
pub const CACHE_SIMILARITY_HIT: &str = "cache_similarity_hit";
pub const ANALYZE_LATENCY_MS: &str = "analyze_latency_ms";
pub const ADMISSION_WAIT_MS: &str = "admission_wait_ms";
pub const ADMISSION_DENIED: &str = "admission_denied";
pub const BATCH_FAILURE: &str = "batch_failure";
pub const CACHE_HIT_RATE: &str = "cache_hit_rate";

/// Samples kept per series for percentile estimation.
const RECENT_SAMPLES: usize = 1024;

#[derive(Debug, Clone)]
struct Series {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    recent: VecDeque<f64>,
}

impl Series {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            recent: VecDeque::with_capacity(16),
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.recent.len() == RECENT_SAMPLES {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
    }

    /// Nearest-rank 95th percentile over the recent window.
    fn p95(&self) -> f64 {
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Thread-safe metrics registry.
#[derive(Debug, Default)]
pub struct MetricsDashboard {
    series: Mutex<HashMap<String, Series>>,
}

impl MetricsDashboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation. Non-finite values are ignored.
    pub fn record_metric(&self, name: &str, value: f64) {
        if !value.is_finite() {
            debug!(metric = name, value, "Ignoring non-finite metric value");
            return;
        }
        let mut series = self.lock();
        match series.get_mut(name) {
            Some(s) => s.record(value),
            None => {
                let mut s = Series::new();
                s.record(value);
                series.insert(name.to_string(), s);
            }
        }
    }

    /// Shorthand for counting events.
    pub fn increment(&self, name: &str) {
        self.record_metric(name, 1.0);
    }

    /// Summary statistics for every series. Reading does not modify state.
    pub fn get_metrics(&self) -> BTreeMap<String, f64> {
        let series = self.lock();
        let mut out = BTreeMap::new();

        for (name, s) in series.iter() {
            out.insert(format!("{}_count", name), s.count as f64);
            out.insert(format!("{}_avg", name), s.sum / s.count as f64);
            out.insert(format!("{}_min", name), s.min);
            out.insert(format!("{}_max", name), s.max);
            out.insert(format!("{}_p95", name), s.p95());
        }

        if let (Some(hits), Some(misses)) = (series.get(CACHE_HIT), series.get(CACHE_MISS)) {
            let total = hits.count + misses.count;
            out.insert(CACHE_HIT_RATE.to_string(), hits.count as f64 / total as f64);
        }

        out
    }

    /// Number of observations recorded under `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.lock().get(name).map_or(0, |s| s.count)
    }

    /// Drop every series at once.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// One-line digest for the periodic pulse log.
    pub fn summary(&self) -> String {
        let metrics = self.get_metrics();
        let pick = |key: &str| metrics.get(key).copied().unwrap_or(0.0);
        format!(
            "hits={} misses={} hit_rate={:.2} denied={} failures={} latency_avg={:.1}ms latency_p95={:.1}ms",
            pick("cache_hit_count"),
            pick("cache_miss_count"),
            pick(CACHE_HIT_RATE),
            pick("admission_denied_count"),
            pick("batch_failure_count"),
            pick("analyze_latency_ms_avg"),
            pick("analyze_latency_ms_p95"),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Series>> {
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates() {
        let dash = MetricsDashboard::new();
        for v in [10.0, 20.0, 30.0, 40.0] {
            dash.record_metric("latency", v);
        }
        let m = dash.get_metrics();
        assert_eq!(m["latency_count"], 4.0);
        assert_eq!(m["latency_avg"], 25.0);
        assert_eq!(m["latency_min"], 10.0);
        assert_eq!(m["latency_max"], 40.0);
        assert_eq!(m["latency_p95"], 40.0);
        assert!(!m.contains_key(CACHE_HIT_RATE));
    }

    #[test]
    fn test_get_metrics_is_idempotent() {
        let dash = MetricsDashboard::new();
        dash.record_metric("a", 1.0);
        dash.increment(CACHE_HIT);
        assert_eq!(dash.get_metrics(), dash.get_metrics());
    }

    #[test]
    fn test_reset_empties_metrics() {
        let dash = MetricsDashboard::new();
        dash.record_metric("a", 1.0);
        dash.increment(CACHE_MISS);
        dash.reset();
        assert!(dash.get_metrics().is_empty());
        assert_eq!(dash.count("a"), 0);
    }

    #[test]
    fn test_cache_hit_rate_needs_both_series() {
        let dash = MetricsDashboard::new();
        dash.increment(CACHE_HIT);
        dash.increment(CACHE_HIT);
        dash.increment(CACHE_HIT);
        assert!(!dash.get_metrics().contains_key(CACHE_HIT_RATE));

        dash.increment(CACHE_MISS);
        let m = dash.get_metrics();
        assert_eq!(m[CACHE_HIT_RATE], 0.75);
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let dash = MetricsDashboard::new();
        dash.record_metric("x", f64::NAN);
        dash.record_metric("x", f64::INFINITY);
        assert!(dash.get_metrics().is_empty());
    }

    #[test]
    fn test_p95_uses_recent_window() {
        let dash = MetricsDashboard::new();
        for i in 1..=100 {
            dash.record_metric("lat", i as f64);
        }
        assert_eq!(dash.get_metrics()["lat_p95"], 95.0);

        // flood the window with small values; old outliers age out of p95
        for _ in 0..RECENT_SAMPLES {
            dash.record_metric("lat", 1.0);
        }
        let m = dash.get_metrics();
        assert_eq!(m["lat_p95"], 1.0);
        assert_eq!(m["lat_max"], 100.0);
    }

    #[test]
    fn test_summary_mentions_hit_rate() {
        let dash = MetricsDashboard::new();
        dash.increment(CACHE_HIT);
        dash.increment(CACHE_MISS);
        assert!(dash.summary().contains("hit_rate=0.50"));
    }
}
