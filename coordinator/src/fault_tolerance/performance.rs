//! Rolling performance samples per key
//!
//! Keys follow the breaker convention (`node:<peer id>`) for node calls;
//! the engine records whole sessions under its own key. Samples older than
//! the configured window are dropped on every write and on [`prune`].
//!
//! [`prune`]: PerformanceTracker::prune

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::config::PerformanceTrackingConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSample {
    pub at: Instant,
    pub latency: Duration,
    pub success: bool,
}

/// Aggregates over one key's current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub key: String,
    pub samples: usize,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_latency: Duration,
    pub p95_latency: Duration,
    /// Samples per second over the observed span
    pub throughput: f64,
}

impl PerformanceSummary {
    fn from_samples<'a>(key: &str, samples: impl Iterator<Item = &'a PerformanceSample>) -> Option<Self> {
        let samples: Vec<&PerformanceSample> = samples.collect();
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let successes = samples.iter().filter(|s| s.success).count();
        let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
        latencies.sort();
        let total: Duration = latencies.iter().sum();
        let p95_index = ((count as f64 * 0.95).ceil() as usize).clamp(1, count) - 1;

        let oldest = samples.iter().map(|s| s.at).min().unwrap_or_else(Instant::now);
        let span = oldest.elapsed().max(Duration::from_secs(1));
        let success_rate = successes as f64 / count as f64;

        Some(Self {
            key: key.to_string(),
            samples: count,
            success_rate,
            error_rate: 1.0 - success_rate,
            avg_latency: total / count as u32,
            p95_latency: latencies[p95_index],
            throughput: count as f64 / span.as_secs_f64(),
        })
    }
}

#[derive(Debug)]
pub struct PerformanceTracker {
    config: RwLock<PerformanceTrackingConfig>,
    series: RwLock<HashMap<String, VecDeque<PerformanceSample>>>,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(PerformanceTrackingConfig::default())
    }
}

impl PerformanceTracker {
    pub fn new(config: PerformanceTrackingConfig) -> Self {
        Self {
            config: RwLock::new(config),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub async fn update_config(&self, config: PerformanceTrackingConfig) {
        *self.config.write().await = config;
    }

    pub async fn window(&self) -> Duration {
        self.config.read().await.window_size
    }

    /// Add one sample; ignored while tracking is disabled
    pub async fn record(&self, key: &str, latency: Duration, success: bool) {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return;
        }

        let now = Instant::now();
        let mut series = self.series.write().await;
        let samples = series.entry(key.to_string()).or_default();
        samples.push_back(PerformanceSample {
            at: now,
            latency,
            success,
        });
        evict_before(samples, now, config.window_size);
    }

    pub async fn summary(&self, key: &str) -> Option<PerformanceSummary> {
        let window = self.window().await;
        let now = Instant::now();
        let series = self.series.read().await;
        let samples = series.get(key)?;
        PerformanceSummary::from_samples(key, in_window(samples, now, window))
    }

    /// Summaries of every key, ordered by key
    pub async fn summaries(&self) -> Vec<PerformanceSummary> {
        let window = self.window().await;
        let now = Instant::now();
        let series = self.series.read().await;
        let mut all: Vec<PerformanceSummary> = series
            .iter()
            .filter_map(|(key, samples)| {
                PerformanceSummary::from_samples(key, in_window(samples, now, window))
            })
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// One summary over every key's samples
    pub async fn overall(&self) -> Option<PerformanceSummary> {
        let window = self.window().await;
        let now = Instant::now();
        let series = self.series.read().await;
        PerformanceSummary::from_samples(
            "overall",
            series
                .values()
                .flat_map(|samples| in_window(samples, now, window)),
        )
    }

    /// Samples for `key` newer than `window`, oldest first
    pub async fn recent(&self, key: &str, window: Duration) -> Vec<PerformanceSample> {
        let now = Instant::now();
        let series = self.series.read().await;
        series
            .get(key)
            .map(|samples| in_window(samples, now, window).copied().collect())
            .unwrap_or_default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let series = self.series.read().await;
        let mut keys: Vec<String> = series.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop expired samples and empty keys, returning how many samples went
    pub async fn prune(&self) -> usize {
        let window = self.window().await;
        let now = Instant::now();
        let mut series = self.series.write().await;
        let mut removed = 0;
        for samples in series.values_mut() {
            removed += evict_before(samples, now, window);
        }
        series.retain(|_, samples| !samples.is_empty());
        if removed > 0 {
            debug!(removed = removed, "Pruned expired performance samples");
        }
        removed
    }
}

fn in_window(
    samples: &VecDeque<PerformanceSample>,
    now: Instant,
    window: Duration,
) -> impl Iterator<Item = &PerformanceSample> {
    samples
        .iter()
        .filter(move |s| now.saturating_duration_since(s.at) <= window)
}

fn evict_before(samples: &mut VecDeque<PerformanceSample>, now: Instant, window: Duration) -> usize {
    let mut removed = 0;
    while let Some(front) = samples.front() {
        if now.saturating_duration_since(front.at) > window {
            samples.pop_front();
            removed += 1;
        } else {
            break;
        }
    }
    removed
}
